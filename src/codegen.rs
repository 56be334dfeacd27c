//! Code generation: lower the parsed AST into AT&T x86-64 assembly.
//!
//! The emitter walks the tree with a single value register: every expression
//! leaves its result in %rax, and binary operators stash the right-hand
//! value on the hardware stack while the left-hand side is evaluated.
//! Locals live on the stack frame and are addressed relative to %rbp.

use crate::error::{CompileError, CompileResult};
use crate::parser::{AstNode, BinaryOp, Function, Stmt};

/// Emit assembly for a function.
pub fn generate(func: &Function, source: &str) -> CompileResult<String> {
  let mut generator = CodeGenerator::new(func, source);
  generator.emit_program()?;
  Ok(generator.finish())
}

struct CodeGenerator<'a> {
  func: &'a Function,
  source: &'a str,
  asm: String,
  label_count: u32,
  depth: i64,
}

impl<'a> CodeGenerator<'a> {
  fn new(func: &'a Function, source: &'a str) -> Self {
    Self {
      func,
      source,
      asm: String::new(),
      label_count: 0,
      depth: 0,
    }
  }

  fn emit_program(&mut self) -> CompileResult<()> {
    self.asm.push_str(".globl main\n");
    self.asm.push_str("main:\n");
    self.asm.push_str("    push %rbp\n");
    self.asm.push_str("    mov %rsp, %rbp\n");
    self
      .asm
      .push_str(&format!("    sub ${}, %rsp\n", self.func.stack_size));

    let body = self.func.body.as_deref();
    self.emit_stmt_list(body)?;
    debug_assert_eq!(self.depth, 0);

    self.asm.push_str(".L.return:\n");
    self.asm.push_str("    mov %rbp, %rsp\n");
    self.asm.push_str("    pop %rbp\n");
    self.asm.push_str("    ret\n");
    Ok(())
  }

  fn emit_stmt_list(&mut self, mut stmt: Option<&Stmt>) -> CompileResult<()> {
    while let Some(s) = stmt {
      self.emit_stmt(s)?;
      stmt = s.next.as_deref();
    }
    Ok(())
  }

  fn emit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
    match &stmt.expr {
      AstNode::Return { value, .. } => {
        self.emit_expr(value)?;
        self.asm.push_str("    jmp .L.return\n");
      }
      AstNode::Block { body, .. } => {
        self.emit_stmt_list(body.as_deref())?;
      }
      AstNode::If {
        cond,
        then_branch,
        else_branch,
        ..
      } => {
        let c = self.next_label();
        self.emit_expr(cond)?;
        self.asm.push_str("    cmp $0, %rax\n");
        self.asm.push_str(&format!("    je .L.else.{c}\n"));
        self.emit_stmt(then_branch)?;
        self.asm.push_str(&format!("    jmp .L.end.{c}\n"));
        self.asm.push_str(&format!(".L.else.{c}:\n"));
        if let Some(else_branch) = else_branch.as_deref() {
          self.emit_stmt(else_branch)?;
        }
        self.asm.push_str(&format!(".L.end.{c}:\n"));
      }
      AstNode::For {
        init,
        cond,
        inc,
        body,
        ..
      } => {
        let c = self.next_label();
        if let Some(init) = init.as_deref() {
          self.emit_expr(init)?;
        }
        self.asm.push_str(&format!(".L.begin.{c}:\n"));
        if let Some(cond) = cond.as_deref() {
          self.emit_expr(cond)?;
          self.asm.push_str("    cmp $0, %rax\n");
          self.asm.push_str(&format!("    je .L.end.{c}\n"));
        }
        self.emit_stmt(body)?;
        if let Some(inc) = inc.as_deref() {
          self.emit_expr(inc)?;
        }
        self.asm.push_str(&format!("    jmp .L.begin.{c}\n"));
        self.asm.push_str(&format!(".L.end.{c}:\n"));
      }
      // Anything else in statement position is an expression statement;
      // its value is simply left behind in %rax.
      expr => {
        self.emit_expr(expr)?;
      }
    }
    Ok(())
  }

  /// Emit code leaving the expression's value in %rax.
  fn emit_expr(&mut self, node: &AstNode) -> CompileResult<()> {
    match node {
      AstNode::Num { value, .. } => {
        self.asm.push_str(&format!("    mov ${value}, %rax\n"));
      }
      AstNode::Neg { operand, .. } => {
        self.emit_expr(operand)?;
        self.asm.push_str("    neg %rax\n");
      }
      AstNode::Var { .. } => {
        self.emit_addr(node)?;
        self.asm.push_str("    mov (%rax), %rax\n");
      }
      AstNode::Deref { operand, .. } => {
        self.emit_expr(operand)?;
        self.asm.push_str("    mov (%rax), %rax\n");
      }
      AstNode::Addr { operand, .. } => {
        self.emit_addr(operand)?;
      }
      AstNode::Assign { lhs, rhs, .. } => {
        self.emit_addr(lhs)?;
        self.push();
        self.emit_expr(rhs)?;
        self.pop("%rdi");
        self.asm.push_str("    mov %rax, (%rdi)\n");
      }
      AstNode::Binary { op, lhs, rhs, .. } => {
        self.emit_expr(rhs)?;
        self.push();
        self.emit_expr(lhs)?;
        self.pop("%rdi");
        match op {
          BinaryOp::Add => self.asm.push_str("    add %rdi, %rax\n"),
          BinaryOp::Sub => self.asm.push_str("    sub %rdi, %rax\n"),
          BinaryOp::Mul => self.asm.push_str("    imul %rdi, %rax\n"),
          BinaryOp::Div => {
            self.asm.push_str("    cqo\n");
            self.asm.push_str("    idiv %rdi\n");
          }
          BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
            self.asm.push_str("    cmp %rdi, %rax\n");
            match op {
              BinaryOp::Eq => self.asm.push_str("    sete %al\n"),
              BinaryOp::Ne => self.asm.push_str("    setne %al\n"),
              BinaryOp::Lt => self.asm.push_str("    setl %al\n"),
              _ => self.asm.push_str("    setle %al\n"),
            }
            self.asm.push_str("    movzb %al, %rax\n");
          }
        }
      }
      AstNode::Return { .. } | AstNode::Block { .. } | AstNode::If { .. } | AstNode::For { .. } => {
        let token = node.token();
        return Err(CompileError::at_span(
          self.source,
          token.loc,
          token.len,
          "expected an expression",
        ));
      }
    }
    Ok(())
  }

  /// Emit code leaving the address of an lvalue in %rax. Only variables and
  /// dereferences have addresses.
  fn emit_addr(&mut self, node: &AstNode) -> CompileResult<()> {
    match node {
      AstNode::Var { obj, .. } => {
        let offset = self.func.locals[*obj].offset;
        self.asm.push_str(&format!("    lea {offset}(%rbp), %rax\n"));
        Ok(())
      }
      AstNode::Deref { operand, .. } => self.emit_expr(operand),
      _ => {
        let token = node.token();
        Err(CompileError::at_span(
          self.source,
          token.loc,
          token.len,
          "not addressable",
        ))
      }
    }
  }

  fn push(&mut self) {
    self.asm.push_str("    push %rax\n");
    self.depth += 1;
  }

  fn pop(&mut self, reg: &str) {
    self.asm.push_str(&format!("    pop {reg}\n"));
    self.depth -= 1;
  }

  fn next_label(&mut self) -> u32 {
    self.label_count += 1;
    self.label_count
  }

  fn finish(self) -> String {
    self.asm
  }
}
