mod common;

use common::FakeTarget;
use rbprobe_runtime::{evaluate, Inferior};

#[test]
fn test_evaluate_returns_inspected_result() {
    let mut target = FakeTarget::new();
    target.eval_result = "[1, 2, 3]".to_string();

    let result = evaluate(&mut target, "[1, 2] << 3").unwrap();

    assert_eq!(result, "[1, 2, 3]");
    let evaluated = target.evaluated.borrow().clone().unwrap();
    assert!(evaluated.contains("([1, 2] << 3).inspect"));
    assert_eq!(target.calls_to("free").len(), 2);
    assert!(!target.unwind_on_signal());
}

#[test]
fn test_evaluate_reports_protect_failure() {
    let mut target = FakeTarget::new();
    target.eval_state = 6;

    let err = evaluate(&mut target, "raise 'x'").unwrap_err();

    assert!(err.to_string().contains("protect state 6"));
    assert!(target.calls_to("rb_string_value_cstr").is_empty());
    assert_eq!(target.calls_to("free").len(), 2);
}
