//! Code generation tests: emitted assembly shape, evaluation order, label
//! allocation and stack discipline.

use gocc::generate_assembly;
use test_case::test_case;

/// Assert that every needle occurs in the assembly, in the given order.
fn assert_contains_in_order(asm: &str, needles: &[&str]) {
  let mut pos = 0;
  for needle in needles {
    match asm[pos..].find(needle) {
      Some(i) => pos += i + needle.len(),
      None => panic!("missing `{needle}` after byte {pos} in:\n{asm}"),
    }
  }
}

#[test]
fn test_return_constant_golden() {
  let expected = "\
.globl main
main:
    push %rbp
    mov %rsp, %rbp
    sub $0, %rsp
    mov $42, %rax
    jmp .L.return
.L.return:
    mov %rbp, %rsp
    pop %rbp
    ret
";
  assert_eq!(generate_assembly("return 42;").expect("compile"), expected);
}

#[test_case("return 0;"; "return_zero")]
#[test_case("return 5+6*7;"; "precedence")]
#[test_case("return (3+5)/2;"; "grouping")]
#[test_case("{ int a=3; int z=5; return a+z; }"; "locals")]
#[test_case("{ int i=0; int j=0; for (i=0; i<=10; i=i+1) j=i+j; return j; }"; "for_loop")]
#[test_case("{ int x=3; int *y=&x; return *y; }"; "pointer_roundtrip")]
#[test_case("{ if (0) return 2; return 3; }"; "if_false")]
#[test_case("{ int i=0; while (i<9) i=i+1; return i; }"; "while_loop")]
fn test_emits_a_complete_main(source: &str) {
  let asm = generate_assembly(source).expect("compilation should succeed");
  assert!(asm.starts_with(".globl main\nmain:\n"), "{asm}");
  assert!(asm.contains(".L.return:"), "{asm}");
  assert!(asm.ends_with("    ret\n"), "{asm}");
  // Every intermediate push is consumed by the matching operand pop.
  assert_eq!(
    asm.matches("push %rax").count(),
    asm.matches("pop %rdi").count(),
    "{asm}"
  );
}

#[test]
fn test_empty_program_still_emits_prologue_and_epilogue() {
  let asm = generate_assembly("").expect("compile");
  assert_contains_in_order(
    &asm,
    &[
      ".globl main",
      "main:",
      "push %rbp",
      "sub $0, %rsp",
      ".L.return:",
      "ret",
    ],
  );
}

#[test]
fn test_binary_operands_evaluate_right_first() {
  let asm = generate_assembly("return 5+6*7;").expect("compile");
  assert_contains_in_order(
    &asm,
    &[
      "mov $7, %rax",
      "push %rax",
      "mov $6, %rax",
      "pop %rdi",
      "imul %rdi, %rax",
      "push %rax",
      "mov $5, %rax",
      "pop %rdi",
      "add %rdi, %rax",
      "jmp .L.return",
    ],
  );
}

#[test]
fn test_division_sign_extends() {
  let asm = generate_assembly("return (3+5)/2;").expect("compile");
  assert_contains_in_order(&asm, &["cqo", "idiv %rdi"]);
}

#[test]
fn test_comparison_materialises_a_flag() {
  let asm = generate_assembly("return 1<2;").expect("compile");
  assert_contains_in_order(&asm, &["cmp %rdi, %rax", "setl %al", "movzb %al, %rax"]);
}

#[test]
fn test_frame_size_and_local_addresses() {
  let asm = generate_assembly("{ int a=3; int z=5; return a+z; }").expect("compile");
  assert!(asm.contains("sub $16, %rsp"), "{asm}");
  assert!(asm.contains("lea -8(%rbp), %rax"), "{asm}");
  assert!(asm.contains("lea -16(%rbp), %rax"), "{asm}");
}

#[test]
fn test_assignment_stores_through_the_popped_address() {
  let asm = generate_assembly("{ int a=0; int b=0; a=b=3; return a; }").expect("compile");
  assert_eq!(asm.matches("mov %rax, (%rdi)").count(), 4, "{asm}");
}

#[test]
fn test_address_of_and_dereference() {
  let asm = generate_assembly("{ int x=3; int *y=&x; return *y; }").expect("compile");
  // `&x` is a bare lea with no load; `*y` loads twice (the pointer, then
  // the pointee).
  assert!(asm.contains("lea -8(%rbp), %rax"), "{asm}");
  assert!(asm.matches("mov (%rax), %rax").count() >= 2, "{asm}");
}

#[test]
fn test_if_else_label_shape() {
  let asm = generate_assembly("{ if (0) return 2; return 3; }").expect("compile");
  assert_contains_in_order(
    &asm,
    &[
      "cmp $0, %rax",
      "je .L.else.1",
      "mov $2, %rax",
      "jmp .L.end.1",
      ".L.else.1:",
      ".L.end.1:",
      "mov $3, %rax",
    ],
  );
}

#[test]
fn test_while_label_shape() {
  let asm = generate_assembly("{ int i=0; while (i<9) i=i+1; return i; }").expect("compile");
  assert_contains_in_order(
    &asm,
    &[
      ".L.begin.1:",
      "cmp $0, %rax",
      "je .L.end.1",
      "jmp .L.begin.1",
      ".L.end.1:",
    ],
  );
}

#[test]
fn test_for_without_condition_loops_unconditionally() {
  let asm = generate_assembly("{ int i=0; for (;;) return i; return 0; }").expect("compile");
  assert!(asm.contains(".L.begin.1:"), "{asm}");
  assert!(!asm.contains("je .L.end.1"), "{asm}");
}

#[test]
fn test_label_indices_are_unique() {
  let source = "{ int i=0; \
     for (i=0; i<3; i=i+1) { if (i<2) i=i+1; else i=i+2; } \
     while (i<10) i=i+1; \
     if (1) return 1; \
     return 0; }";
  let asm = generate_assembly(source).expect("compile");
  let labels: Vec<&str> = asm
    .lines()
    .filter(|line| line.starts_with(".L.") && line.ends_with(':'))
    .collect();
  let unique: std::collections::HashSet<&&str> = labels.iter().collect();
  assert_eq!(labels.len(), unique.len(), "duplicate labels in:\n{asm}");
  // Four labelled constructs plus the shared epilogue.
  assert_eq!(labels.len(), 9, "{asm}");
}

#[test]
fn test_scaled_pointer_arithmetic_reaches_the_assembly() {
  let asm =
    generate_assembly("{ int x=0; int *y=&x; return *(y+0); }").expect("compile");
  // The scale constant from the rewrite is loaded verbatim.
  assert!(asm.contains("mov $8, %rax"), "{asm}");
}
