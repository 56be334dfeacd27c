//! Negative tests: invalid programs are rejected with a caret diagnostic.

use gocc::generate_assembly;
use test_case::test_case;

#[test_case("1+", "expected an expression"; "truncated_sum")]
#[test_case("return;return;", "expected an expression"; "return_without_value")]
#[test_case("a;", "use of undeclared identifier 'a'"; "undeclared_identifier")]
#[test_case("a = 3;", "use of undeclared identifier 'a'"; "assignment_to_undeclared")]
#[test_case("return *1;", "invalid pointer dereference"; "dereference_of_integer")]
#[test_case("return &3;", "not addressable"; "address_of_literal")]
#[test_case("3=4;", "not addressable"; "assignment_to_literal")]
#[test_case("return 1", "expected \";\""; "missing_semicolon")]
#[test_case("int 3;", "expected an identifier"; "declarator_without_name")]
#[test_case("{ return 1;", "expected '}'"; "unterminated_block")]
#[test_case("return (1+2;", "expected \")\""; "unterminated_group")]
#[test_case("else;", "unexpected 'else'"; "stray_else")]
#[test_case("return 99999999999999999999;", "invalid number"; "numeric_overflow")]
#[test_case("return @;", "invalid token"; "invalid_character")]
#[test_case("1++;", "unsupported operator"; "unsupported_operator")]
#[test_case("{ int x=0; int *y=&x; int *z=&x; y+z; }", "invalid operands to binary '+'"; "pointer_plus_pointer")]
#[test_case("{ int x=0; int *y=&x; 1-y; }", "invalid operands to binary '-'"; "integer_minus_pointer")]
fn test_rejects(source: &str, needle: &str) {
  let err = generate_assembly(source).expect_err("compilation should fail");
  let message = err.to_string();
  assert!(
    message.contains(needle),
    "missing `{needle}` in:\n{message}"
  );
}

#[test]
fn test_diagnostic_underlines_the_offending_byte() {
  let err = generate_assembly("return @;").expect_err("compilation should fail");
  assert_eq!(err.to_string(), "return @;\n       ^ invalid token");
}

#[test]
fn test_diagnostic_underlines_the_whole_lexeme() {
  let err = generate_assembly("foo;").expect_err("compilation should fail");
  assert_eq!(
    err.to_string(),
    "foo;\n^^^ use of undeclared identifier 'foo'"
  );
}

#[test]
fn test_diagnostic_points_past_the_end_on_truncated_input() {
  let err = generate_assembly("1+").expect_err("compilation should fail");
  assert_eq!(err.to_string(), "1+\n  ^ expected an expression");
}
