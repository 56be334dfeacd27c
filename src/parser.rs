//! Recursive-descent parser producing a statement list and expression AST.
//!
//! The parser mirrors the classic chibicc structure: a precedence ladder of
//! expression helpers under a thin statement layer, so sequencing lives
//! outside the expression tree. Type annotation runs as a post-order walk
//! over the finished nodes; the `+`/`-` builders invoke it early because the
//! pointer-arithmetic rewrites need operand types before the node exists.

use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};
use crate::ty::Type;
use std::collections::HashMap;

/// Binary operators recognised by the language. `>` and `>=` are desugared
/// into `<` and `<=` with the operands swapped, so no dedicated kinds exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Expression and statement tree produced by the parser. Every node carries
/// the token that introduced it so later stages can point diagnostics at the
/// right spot, and a type slot filled in by annotation.
#[derive(Debug, Clone)]
pub enum AstNode {
  Num {
    value: i64,
    token: Token,
    ty: Option<Type>,
  },
  Var {
    obj: usize,
    token: Token,
    ty: Option<Type>,
  },
  Neg {
    operand: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Addr {
    operand: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Deref {
    operand: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Assign {
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Return {
    value: Box<AstNode>,
    token: Token,
    ty: Option<Type>,
  },
  Block {
    body: Option<Box<Stmt>>,
    token: Token,
    ty: Option<Type>,
  },
  If {
    cond: Box<AstNode>,
    then_branch: Box<Stmt>,
    else_branch: Option<Box<Stmt>>,
    token: Token,
    ty: Option<Type>,
  },
  For {
    init: Option<Box<AstNode>>,
    cond: Option<Box<AstNode>>,
    inc: Option<Box<AstNode>>,
    body: Box<Stmt>,
    token: Token,
    ty: Option<Type>,
  },
}

impl AstNode {
  pub fn number(value: i64, token: Token) -> Self {
    Self::Num {
      value,
      token,
      ty: None,
    }
  }

  pub fn var(obj: usize, token: Token) -> Self {
    Self::Var {
      obj,
      token,
      ty: None,
    }
  }

  pub fn unary_neg(operand: AstNode, token: Token) -> Self {
    Self::Neg {
      operand: Box::new(operand),
      token,
      ty: None,
    }
  }

  pub fn addr(operand: AstNode, token: Token) -> Self {
    Self::Addr {
      operand: Box::new(operand),
      token,
      ty: None,
    }
  }

  pub fn deref(operand: AstNode, token: Token) -> Self {
    Self::Deref {
      operand: Box::new(operand),
      token,
      ty: None,
    }
  }

  pub fn binary(op: BinaryOp, lhs: AstNode, rhs: AstNode, token: Token) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
      token,
      ty: None,
    }
  }

  pub fn assign(lhs: AstNode, rhs: AstNode, token: Token) -> Self {
    Self::Assign {
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
      token,
      ty: None,
    }
  }

  pub fn ret(value: AstNode, token: Token) -> Self {
    Self::Return {
      value: Box::new(value),
      token,
      ty: None,
    }
  }

  pub fn block(body: Option<Box<Stmt>>, token: Token) -> Self {
    Self::Block {
      body,
      token,
      ty: None,
    }
  }

  pub fn if_stmt(
    cond: AstNode,
    then_branch: Box<Stmt>,
    else_branch: Option<Box<Stmt>>,
    token: Token,
  ) -> Self {
    Self::If {
      cond: Box::new(cond),
      then_branch,
      else_branch,
      token,
      ty: None,
    }
  }

  pub fn for_stmt(
    init: Option<AstNode>,
    cond: Option<AstNode>,
    inc: Option<AstNode>,
    body: Box<Stmt>,
    token: Token,
  ) -> Self {
    Self::For {
      init: init.map(Box::new),
      cond: cond.map(Box::new),
      inc: inc.map(Box::new),
      body,
      token,
      ty: None,
    }
  }

  pub fn while_stmt(cond: AstNode, body: Box<Stmt>, token: Token) -> Self {
    Self::for_stmt(None, Some(cond), None, body, token)
  }

  pub fn ty(&self) -> Option<&Type> {
    match self {
      AstNode::Num { ty, .. }
      | AstNode::Var { ty, .. }
      | AstNode::Neg { ty, .. }
      | AstNode::Addr { ty, .. }
      | AstNode::Deref { ty, .. }
      | AstNode::Binary { ty, .. }
      | AstNode::Assign { ty, .. }
      | AstNode::Return { ty, .. }
      | AstNode::Block { ty, .. }
      | AstNode::If { ty, .. }
      | AstNode::For { ty, .. } => ty.as_ref(),
    }
  }

  pub fn ty_mut(&mut self) -> &mut Option<Type> {
    match self {
      AstNode::Num { ty, .. }
      | AstNode::Var { ty, .. }
      | AstNode::Neg { ty, .. }
      | AstNode::Addr { ty, .. }
      | AstNode::Deref { ty, .. }
      | AstNode::Binary { ty, .. }
      | AstNode::Assign { ty, .. }
      | AstNode::Return { ty, .. }
      | AstNode::Block { ty, .. }
      | AstNode::If { ty, .. }
      | AstNode::For { ty, .. } => ty,
    }
  }

  /// The token that introduced this node, for diagnostics.
  pub fn token(&self) -> &Token {
    match self {
      AstNode::Num { token, .. }
      | AstNode::Var { token, .. }
      | AstNode::Neg { token, .. }
      | AstNode::Addr { token, .. }
      | AstNode::Deref { token, .. }
      | AstNode::Binary { token, .. }
      | AstNode::Assign { token, .. }
      | AstNode::Return { token, .. }
      | AstNode::Block { token, .. }
      | AstNode::If { token, .. }
      | AstNode::For { token, .. } => token,
    }
  }
}

/// Singly-linked list of statements. Each node holds exactly one statement;
/// a bare expression in this position is an expression statement.
#[derive(Debug, Clone)]
pub struct Stmt {
  pub expr: AstNode,
  pub next: Option<Box<Stmt>>,
}

impl Stmt {
  /// Iterate statements in order. Useful for tests and future passes.
  pub fn iter(&self) -> StmtIter<'_> {
    StmtIter {
      current: Some(self),
    }
  }
}

pub struct StmtIter<'a> {
  current: Option<&'a Stmt>,
}

impl<'a> Iterator for StmtIter<'a> {
  type Item = &'a AstNode;

  fn next(&mut self) -> Option<Self::Item> {
    let stmt = self.current?;
    self.current = stmt.next.as_deref();
    Some(&stmt.expr)
  }
}

/// A local variable.
#[derive(Debug, Clone)]
pub struct Obj {
  pub name: String,
  pub offset: i64,
  pub ty: Type,
}

impl Obj {
  pub fn new(name: impl Into<String>, ty: Type) -> Self {
    Self {
      name: name.into(),
      offset: 0,
      ty,
    }
  }
}

/// The root of a compilation: the implicit `main` body, its locals and the
/// stack frame size computed from them.
#[derive(Debug, Clone)]
pub struct Function {
  pub body: Option<Box<Stmt>>,
  pub locals: Vec<Obj>,
  pub stack_size: i64,
}

/// Parse a token stream into the implicit `main` function.
// Parse procedure overview:
// - `parse` initialises the token cursor and the parser context, then loops
//   over top-level statements until the end marker.
// - Each statement is annotated as soon as it is parsed; the `+`/`-` builders
//   have already annotated the subtrees they rewrote.
// - Offsets are assigned once the whole program has been seen.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Function> {
  let mut stream = TokenStream::new(tokens, source);
  let mut ctx = ParserContext::new(source);

  let mut head: Option<Box<Stmt>> = None;
  let mut tail = &mut head;
  while !stream.is_eof() {
    let mut stmt = parse_stmt(&mut stream, &mut ctx)?;
    ctx.annotate_type(&mut stmt.expr)?;
    *tail = Some(stmt);
    tail = &mut tail.as_mut().unwrap().next;
  }

  let stack_size = ctx.assign_offsets();
  Ok(Function {
    body: head,
    locals: ctx.into_locals(),
    stack_size,
  })
}

struct ParserContext<'a> {
  source: &'a str,
  locals: Vec<Obj>,
  map: HashMap<String, usize>,
}

impl<'a> ParserContext<'a> {
  fn new(source: &'a str) -> Self {
    Self {
      source,
      locals: Vec::new(),
      map: HashMap::new(),
    }
  }

  /// Record a local, reusing the existing slot when the name is already
  /// known: the first declaration wins and later ones alias it.
  fn declare_local(&mut self, name: &str, ty: Type) -> usize {
    if let Some(&index) = self.map.get(name) {
      return index;
    }
    let index = self.locals.len();
    self.locals.push(Obj::new(name, ty));
    self.map.insert(name.to_string(), index);
    index
  }

  fn lookup_local(&self, name: &str) -> Option<usize> {
    self.map.get(name).copied()
  }

  /// Hand out RBP-relative slots in declaration order and round the frame
  /// up to the 16-byte alignment the ABI expects.
  fn assign_offsets(&mut self) -> i64 {
    let mut offset: i64 = 0;
    for obj in self.locals.iter_mut() {
      offset += obj.ty.size();
      obj.offset = -offset;
    }
    align_to(offset, 16)
  }

  /// Post-order type annotation. Nodes that already carry a type are left
  /// alone, which makes the walk idempotent and lets the `+`/`-` builders
  /// pre-type the subtrees they synthesise.
  fn annotate_type(&self, node: &mut AstNode) -> CompileResult<()> {
    if node.ty().is_some() {
      return Ok(());
    }
    match node {
      AstNode::Num { ty, .. } => {
        *ty = Some(Type::int());
      }
      AstNode::Var { obj, ty, .. } => {
        let t = self
          .locals
          .get(*obj)
          .map(|o| o.ty.clone())
          .unwrap_or_else(Type::int);
        *ty = Some(t);
      }
      AstNode::Neg { operand, ty, .. } => {
        self.annotate_type(operand)?;
        let t = operand.ty().cloned().unwrap_or_else(Type::int);
        *ty = Some(t);
      }
      AstNode::Addr { operand, ty, .. } => {
        self.annotate_type(operand)?;
        let base = operand.ty().cloned().unwrap_or_else(Type::int);
        *ty = Some(Type::pointer_to(base));
      }
      AstNode::Deref { operand, token, ty } => {
        self.annotate_type(operand)?;
        let operand_ty = operand.ty().cloned().unwrap_or_else(Type::int);
        if !operand_ty.is_pointer() {
          return Err(CompileError::at_span(
            self.source,
            token.loc,
            token.len,
            "invalid pointer dereference",
          ));
        }
        *ty = Some(operand_ty.base().cloned().unwrap_or_else(Type::int));
      }
      AstNode::Binary {
        op, lhs, rhs, ty, ..
      } => {
        self.annotate_type(lhs)?;
        self.annotate_type(rhs)?;
        let t = match op {
          BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            lhs.ty().cloned().unwrap_or_else(Type::int)
          }
          BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => Type::int(),
        };
        *ty = Some(t);
      }
      AstNode::Assign { lhs, rhs, ty, .. } => {
        self.annotate_type(lhs)?;
        self.annotate_type(rhs)?;
        let t = lhs.ty().cloned().unwrap_or_else(Type::int);
        *ty = Some(t);
      }
      AstNode::Return { value, .. } => {
        self.annotate_type(value)?;
      }
      AstNode::Block { body, .. } => {
        self.annotate_stmt_list(body.as_deref_mut())?;
      }
      AstNode::If {
        cond,
        then_branch,
        else_branch,
        ..
      } => {
        self.annotate_type(cond)?;
        self.annotate_stmt_list(Some(then_branch.as_mut()))?;
        if let Some(else_branch) = else_branch.as_mut() {
          self.annotate_stmt_list(Some(else_branch.as_mut()))?;
        }
      }
      AstNode::For {
        init,
        cond,
        inc,
        body,
        ..
      } => {
        if let Some(init) = init.as_mut() {
          self.annotate_type(init)?;
        }
        if let Some(cond) = cond.as_mut() {
          self.annotate_type(cond)?;
        }
        if let Some(inc) = inc.as_mut() {
          self.annotate_type(inc)?;
        }
        self.annotate_stmt_list(Some(body.as_mut()))?;
      }
    }
    Ok(())
  }

  fn annotate_stmt_list(&self, mut stmt: Option<&mut Stmt>) -> CompileResult<()> {
    while let Some(s) = stmt {
      self.annotate_type(&mut s.expr)?;
      stmt = s.next.as_deref_mut();
    }
    Ok(())
  }

  fn into_locals(self) -> Vec<Obj> {
    self.locals
  }
}

fn align_to(n: i64, align: i64) -> i64 {
  if align == 0 {
    return n;
  }
  ((n + align - 1) / align) * align
}

const POINTER_SIZE: i64 = 8;

// ----- Statement parsing -----
fn parse_stmt(stream: &mut TokenStream<'_>, ctx: &mut ParserContext<'_>) -> CompileResult<Box<Stmt>> {
  match stream.peek_keyword() {
    Some("return") => parse_return_stmt(stream, ctx),
    Some("if") => parse_if_stmt(stream, ctx),
    Some("for") => parse_for_stmt(stream, ctx),
    Some("while") => parse_while_stmt(stream, ctx),
    Some("int") => parse_declaration(stream, ctx),
    Some("else") => Err(CompileError::at(
      stream.source,
      stream.current_loc(),
      "unexpected 'else' without a matching 'if'",
    )),
    _ if stream.peek_is("{") => parse_block(stream, ctx),
    _ => parse_expr_stmt(stream, ctx),
  }
}

fn parse_block(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  stream.skip("{")?;

  let mut head: Option<Box<Stmt>> = None;
  let mut tail = &mut head;
  while !stream.equal("}") {
    if stream.is_eof() {
      return Err(CompileError::at(
        stream.source,
        stream.source.len(),
        "expected '}'",
      ));
    }
    let stmt = parse_stmt(stream, ctx)?;
    *tail = Some(stmt);
    tail = &mut tail.as_mut().unwrap().next;
  }

  Ok(Box::new(Stmt {
    expr: AstNode::block(head, token),
    next: None,
  }))
}

fn parse_expr_stmt(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  if stream.equal(";") {
    // The empty statement is an empty block so later stages have no
    // special case.
    return Ok(Box::new(Stmt {
      expr: AstNode::block(None, token),
      next: None,
    }));
  }
  let expr = parse_expr(stream, ctx)?;
  stream.skip(";")?;

  Ok(Box::new(Stmt { expr, next: None }))
}

fn parse_return_stmt(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  stream.skip("return")?;
  let value = parse_expr(stream, ctx)?;
  stream.skip(";")?;
  Ok(Box::new(Stmt {
    expr: AstNode::ret(value, token),
    next: None,
  }))
}

fn parse_if_stmt(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  stream.skip("if")?;
  stream.skip("(")?;
  let cond = parse_expr(stream, ctx)?;
  stream.skip(")")?;
  let then_branch = parse_stmt(stream, ctx)?;
  let else_branch = if stream.equal("else") {
    Some(parse_stmt(stream, ctx)?)
  } else {
    None
  };

  Ok(Box::new(Stmt {
    expr: AstNode::if_stmt(cond, then_branch, else_branch, token),
    next: None,
  }))
}

fn parse_for_stmt(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  stream.skip("for")?;
  stream.skip("(")?;

  let init = if stream.equal(";") {
    None
  } else {
    let init_expr = parse_expr(stream, ctx)?;
    stream.skip(";")?;
    Some(init_expr)
  };

  let cond = if stream.equal(";") {
    None
  } else {
    let cond_expr = parse_expr(stream, ctx)?;
    stream.skip(";")?;
    Some(cond_expr)
  };

  let inc = if stream.equal(")") {
    None
  } else {
    let inc_expr = parse_expr(stream, ctx)?;
    stream.skip(")")?;
    Some(inc_expr)
  };

  let body = parse_stmt(stream, ctx)?;

  Ok(Box::new(Stmt {
    expr: AstNode::for_stmt(init, cond, inc, body, token),
    next: None,
  }))
}

fn parse_while_stmt(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let token = stream.current_token();
  stream.skip("while")?;
  stream.skip("(")?;
  let cond = parse_expr(stream, ctx)?;
  stream.skip(")")?;
  let body = parse_stmt(stream, ctx)?;

  Ok(Box::new(Stmt {
    expr: AstNode::while_stmt(cond, body, token),
    next: None,
  }))
}

// ----- Declaration parsing -----
fn parse_declspec(stream: &mut TokenStream<'_>) -> CompileResult<Type> {
  if matches!(stream.peek_keyword(), Some("int")) {
    stream.skip("int")?;
    Ok(Type::int())
  } else {
    let loc = stream.current_loc();
    Err(CompileError::at(
      stream.source,
      loc,
      "expected type specifier",
    ))
  }
}

fn parse_declarator(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
  base_ty: &Type,
) -> CompileResult<(usize, Token)> {
  let mut ty = base_ty.clone();
  while stream.equal("*") {
    ty = Type::pointer_to(ty);
  }
  let ident_index = stream.pos;
  let name_token = stream.current_token();
  let (name, _) = stream.get_ident()?;
  let index = ctx.declare_local(&name, ty.with_decl_token(ident_index));
  Ok((index, name_token))
}

/// `int a, *b, c = 3;` becomes a block of one expression statement per
/// declarator: an assignment when an initialiser is present, otherwise a
/// bare reference, so every declarator shows up in the emitted sequence.
fn parse_declaration(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<Box<Stmt>> {
  let decl_token = stream.current_token();
  let base_ty = parse_declspec(stream)?;

  let mut head: Option<Box<Stmt>> = None;
  let mut tail = &mut head;
  if !stream.peek_is(";") {
    loop {
      let (index, name_token) = parse_declarator(stream, ctx, &base_ty)?;
      let var = AstNode::var(index, name_token);
      let expr = if stream.peek_is("=") {
        let assign_token = stream.current_token();
        stream.skip("=")?;
        let init = parse_expr(stream, ctx)?;
        AstNode::assign(var, init, assign_token)
      } else {
        var
      };
      *tail = Some(Box::new(Stmt { expr, next: None }));
      tail = &mut tail.as_mut().unwrap().next;

      if !stream.equal(",") {
        break;
      }
    }
  }
  stream.skip(";")?;

  Ok(Box::new(Stmt {
    expr: AstNode::block(head, decl_token),
    next: None,
  }))
}

// ----- Expression parsing -----
fn parse_expr(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  parse_assign(stream, ctx)
}

fn parse_assign(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let node = parse_equality(stream, ctx)?;

  if stream.peek_is("=") {
    let token = stream.current_token();
    stream.skip("=")?;
    let rhs = parse_assign(stream, ctx)?;
    return Ok(AstNode::assign(node, rhs, token));
  }

  Ok(node)
}

fn parse_equality(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let mut node = parse_relational(stream, ctx)?;

  loop {
    let op_str = match stream.peek_punctuator() {
      Some(symbol @ "==") => symbol,
      Some(symbol @ "!=") => symbol,
      _ => break,
    };

    let op = match op_str {
      "==" => BinaryOp::Eq,
      _ => BinaryOp::Ne,
    };

    let token = stream.current_token();
    stream.skip(op_str)?;
    let rhs = parse_relational(stream, ctx)?;
    node = AstNode::binary(op, node, rhs, token);
  }

  Ok(node)
}

fn parse_relational(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let mut node = parse_add(stream, ctx)?;

  loop {
    let op_str = match stream.peek_punctuator() {
      Some(symbol @ "<") => symbol,
      Some(symbol @ "<=") => symbol,
      Some(symbol @ ">") => symbol,
      Some(symbol @ ">=") => symbol,
      _ => break,
    };

    let token = stream.current_token();
    stream.skip(op_str)?;
    let rhs = parse_add(stream, ctx)?;
    // `a > b` is `b < a`, so only Lt/Le exist in the tree.
    node = match op_str {
      "<" => AstNode::binary(BinaryOp::Lt, node, rhs, token),
      "<=" => AstNode::binary(BinaryOp::Le, node, rhs, token),
      ">" => AstNode::binary(BinaryOp::Lt, rhs, node, token),
      _ => AstNode::binary(BinaryOp::Le, rhs, node, token),
    };
  }

  Ok(node)
}

fn parse_add(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let mut node = parse_mul(stream, ctx)?;

  loop {
    let op_str = match stream.peek_punctuator() {
      Some(symbol @ "+") => symbol,
      Some(symbol @ "-") => symbol,
      _ => break,
    };

    let token = stream.current_token();
    stream.skip(op_str)?;
    let rhs = parse_mul(stream, ctx)?;
    node = match op_str {
      "+" => build_add(ctx, node, rhs, token)?,
      _ => build_sub(ctx, node, rhs, token)?,
    };
  }

  Ok(node)
}

fn parse_mul(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let mut node = parse_unary(stream, ctx)?;

  loop {
    let op_str = match stream.peek_punctuator() {
      Some(symbol @ "*") => symbol,
      Some(symbol @ "/") => symbol,
      _ => break,
    };

    let op = match op_str {
      "*" => BinaryOp::Mul,
      _ => BinaryOp::Div,
    };

    let token = stream.current_token();
    stream.skip(op_str)?;
    let rhs = parse_unary(stream, ctx)?;
    node = AstNode::binary(op, node, rhs, token);
  }

  Ok(node)
}

fn parse_unary(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  let token = stream.current_token();

  if stream.equal("+") {
    return parse_unary(stream, ctx);
  }

  if stream.equal("-") {
    let operand = parse_unary(stream, ctx)?;
    return Ok(AstNode::unary_neg(operand, token));
  }

  if stream.equal("&") {
    let operand = parse_unary(stream, ctx)?;
    return Ok(AstNode::addr(operand, token));
  }

  if stream.equal("*") {
    let operand = parse_unary(stream, ctx)?;
    return Ok(AstNode::deref(operand, token));
  }

  parse_primary(stream, ctx)
}

fn parse_primary(
  stream: &mut TokenStream<'_>,
  ctx: &mut ParserContext<'_>,
) -> CompileResult<AstNode> {
  if stream.equal("(") {
    let node = parse_expr(stream, ctx)?;
    stream.skip(")")?;
    return Ok(node);
  }

  let token = stream.current_token();
  match token.kind {
    TokenKind::Num => {
      let (value, _) = stream.get_number()?;
      Ok(AstNode::number(value, token))
    }
    TokenKind::Ident => {
      let (name, loc) = stream.get_ident()?;
      let index = ctx.lookup_local(&name).ok_or_else(|| {
        CompileError::at_span(
          stream.source,
          loc,
          name.len(),
          format!("use of undeclared identifier '{name}'"),
        )
      })?;
      Ok(AstNode::var(index, token))
    }
    _ => Err(CompileError::at_span(
      stream.source,
      token.loc,
      token.len,
      "expected an expression",
    )),
  }
}

/// Build `lhs + rhs`, scaling the integer side by the pointee size when one
/// operand is a pointer. Both operands must be typed before the shape of the
/// sum can be decided, hence the early annotation.
fn build_add(
  ctx: &ParserContext<'_>,
  mut lhs: AstNode,
  mut rhs: AstNode,
  token: Token,
) -> CompileResult<AstNode> {
  ctx.annotate_type(&mut lhs)?;
  ctx.annotate_type(&mut rhs)?;
  let lhs_ty = lhs.ty().cloned().unwrap_or_else(Type::int);
  let rhs_ty = rhs.ty().cloned().unwrap_or_else(Type::int);

  if lhs_ty.is_integer() && rhs_ty.is_integer() {
    return Ok(AstNode::binary(BinaryOp::Add, lhs, rhs, token));
  }
  if lhs_ty.is_pointer() && rhs_ty.is_integer() {
    let scale = lhs_ty.base().map(|t| t.size()).unwrap_or(POINTER_SIZE);
    let scaled = AstNode::binary(
      BinaryOp::Mul,
      rhs,
      AstNode::number(scale, token.clone()),
      token.clone(),
    );
    return Ok(AstNode::binary(BinaryOp::Add, lhs, scaled, token));
  }
  if lhs_ty.is_integer() && rhs_ty.is_pointer() {
    // Canonicalise `n + p` to `p + n` so the scaled form is uniform.
    let scale = rhs_ty.base().map(|t| t.size()).unwrap_or(POINTER_SIZE);
    let scaled = AstNode::binary(
      BinaryOp::Mul,
      lhs,
      AstNode::number(scale, token.clone()),
      token.clone(),
    );
    return Ok(AstNode::binary(BinaryOp::Add, rhs, scaled, token));
  }

  Err(CompileError::at_span(
    ctx.source,
    token.loc,
    token.len,
    "invalid operands to binary '+'",
  ))
}

/// Build `lhs - rhs`: plain subtraction for integers, scaled displacement
/// for pointer minus integer, and element distance for pointer minus
/// pointer.
fn build_sub(
  ctx: &ParserContext<'_>,
  mut lhs: AstNode,
  mut rhs: AstNode,
  token: Token,
) -> CompileResult<AstNode> {
  ctx.annotate_type(&mut lhs)?;
  ctx.annotate_type(&mut rhs)?;
  let lhs_ty = lhs.ty().cloned().unwrap_or_else(Type::int);
  let rhs_ty = rhs.ty().cloned().unwrap_or_else(Type::int);

  if lhs_ty.is_integer() && rhs_ty.is_integer() {
    return Ok(AstNode::binary(BinaryOp::Sub, lhs, rhs, token));
  }
  if lhs_ty.is_pointer() && rhs_ty.is_integer() {
    let scale = lhs_ty.base().map(|t| t.size()).unwrap_or(POINTER_SIZE);
    let scaled = AstNode::binary(
      BinaryOp::Mul,
      rhs,
      AstNode::number(scale, token.clone()),
      token.clone(),
    );
    return Ok(AstNode::binary(BinaryOp::Sub, lhs, scaled, token));
  }
  if lhs_ty.is_pointer() && rhs_ty.is_pointer() {
    let scale = lhs_ty.base().map(|t| t.size()).unwrap_or(POINTER_SIZE);
    let diff = AstNode::binary(BinaryOp::Sub, lhs, rhs, token.clone());
    let mut node = AstNode::binary(
      BinaryOp::Div,
      diff,
      AstNode::number(scale, token.clone()),
      token,
    );
    ctx.annotate_type(&mut node)?;
    // The distance between two pointers is an element count, not an
    // address.
    *node.ty_mut() = Some(Type::int());
    return Ok(node);
  }

  Err(CompileError::at_span(
    ctx.source,
    token.loc,
    token.len,
    "invalid operands to binary '-'",
  ))
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  /// Take ownership of the token stream; the parser will advance `pos` as it consumes input.
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn current_loc(&self) -> usize {
    self
      .tokens
      .get(self.pos)
      .map(|token| token.loc)
      .unwrap_or(self.source.len())
  }

  /// Clone of the current token, or a synthetic end marker past the stream.
  fn current_token(&self) -> Token {
    self
      .peek()
      .cloned()
      .unwrap_or_else(|| Token::new(TokenKind::Eof, self.source.len(), 0, None))
  }

  fn peek_is(&self, symbol: &str) -> bool {
    self
      .peek()
      .filter(|token| {
        matches!(token.kind, TokenKind::Punctuator | TokenKind::Keyword)
          && token_text(token, self.source) == symbol
      })
      .is_some()
  }

  fn peek_keyword(&self) -> Option<&'a str> {
    self.peek().and_then(|token| {
      if token.kind == TokenKind::Keyword {
        Some(token_text(token, self.source))
      } else {
        None
      }
    })
  }

  fn peek_punctuator(&self) -> Option<&'a str> {
    self.peek().and_then(|token| {
      if token.kind == TokenKind::Punctuator {
        Some(token_text(token, self.source))
      } else {
        None
      }
    })
  }

  /// Consume the current token if it matches the provided punctuator or
  /// keyword.
  fn equal(&mut self, op: &str) -> bool {
    if let Some(token) = self.peek()
      && matches!(token.kind, TokenKind::Punctuator | TokenKind::Keyword)
      && token.len == op.len()
      && token_text(token, self.source) == op
    {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      let (loc, got) = match self.tokens.get(self.pos) {
        Some(token) => (token.loc, describe_token(Some(token), self.source)),
        None => (self.source.len(), "EOF".to_string()),
      };
      Err(CompileError::at(
        self.source,
        loc,
        format!("expected \"{s}\", but got \"{got}\""),
      ))
    }
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.tokens.get(self.pos)
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| {
        CompileError::at(
          self.source,
          token.loc,
          "internal error: numeric token missing value",
        )
      })?;
      let loc = token.loc;
      self.pos += 1;
      return Ok((value, loc));
    }

    let (loc, got) = match self.tokens.get(self.pos) {
      Some(token) => (token.loc, describe_token(Some(token), self.source)),
      None => (self.source.len(), "EOF".to_string()),
    };
    Err(CompileError::at(
      self.source,
      loc,
      format!("expected a number, but got \"{got}\""),
    ))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(String, usize)> {
    if let Some(token) = self.tokens.get(self.pos)
      && token.kind == TokenKind::Ident
    {
      let text = token_text(token, self.source);
      let loc = token.loc;
      self.pos += 1;
      return Ok((text.to_string(), loc));
    }

    let (loc, got) = match self.tokens.get(self.pos) {
      Some(token) => (token.loc, describe_token(Some(token), self.source)),
      None => (self.source.len(), "EOF".to_string()),
    };
    Err(CompileError::at(
      self.source,
      loc,
      format!("expected an identifier, but got \"{got}\""),
    ))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek().map(|token| token.kind), Some(TokenKind::Eof))
  }
}
