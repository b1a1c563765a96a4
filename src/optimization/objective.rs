use super::problem::{OptimizationProblem, SumPolicy};
use super::quantity::{ObjectiveKind, QuantityValue};
use crate::core::EvaluationError;
use indexmap::IndexMap;

/// Signed contribution of one aggregated quantity to the objective.
///
/// Under `Squares`, target and minimize terms add `x²` while maximize terms
/// subtract it.
pub fn contribution(kind: ObjectiveKind, aggregated: f64, policy: SumPolicy) -> f64 {
    match (kind, policy) {
        (ObjectiveKind::Target { value }, SumPolicy::Simple) => aggregated - value,
        (ObjectiveKind::Target { value }, SumPolicy::Squares) => (aggregated - value).powi(2),
        (ObjectiveKind::Minimize, SumPolicy::Simple) => aggregated,
        (ObjectiveKind::Minimize, SumPolicy::Squares) => aggregated.powi(2),
        (ObjectiveKind::Maximize, SumPolicy::Simple) => -aggregated,
        (ObjectiveKind::Maximize, SumPolicy::Squares) => -aggregated.powi(2),
    }
}

/// Sums every objective quantity into the scalar the solver minimizes.
///
/// All quantities are scanned before failing, so the error lists every
/// quantity that produced NaN.
pub fn aggregate<'a, I>(
    objectives: I,
    quantities: &IndexMap<String, QuantityValue>,
    policy: SumPolicy,
) -> Result<f64, EvaluationError>
where
    I: IntoIterator<Item = (&'a str, ObjectiveKind)>,
{
    let mut total = 0.0;
    let mut failures = Vec::new();

    for (name, kind) in objectives {
        match quantities.get(name) {
            Some(q) if !q.value.is_nan() => total += contribution(kind, q.value, policy),
            resolved => {
                let reason = resolved
                    .and_then(|q| q.failure.clone())
                    .unwrap_or_else(|| "value is NaN".into());
                failures.push(format!("{} => Failed to acquire the aggregate value: {}", name, reason));
            }
        }
    }

    if !failures.is_empty() {
        return Err(EvaluationError::InvalidQuantities(failures));
    }
    Ok(total)
}

/// [`aggregate`] over the problem's objective quantities.
pub fn objective_value(
    problem: &OptimizationProblem,
    quantities: &IndexMap<String, QuantityValue>,
) -> Result<f64, EvaluationError> {
    aggregate(
        problem.objective_quantities().map(|(q, kind)| (q.name.as_str(), kind)),
        quantities,
        problem.sum_policy(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(entries: &[(&str, QuantityValue)]) -> IndexMap<String, QuantityValue> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn target_squares_and_maximize_simple() {
        let q = values(&[("q", QuantityValue::ok(8.0))]);
        let target = aggregate([("q", ObjectiveKind::Target { value: 5.0 })], &q, SumPolicy::Squares).unwrap();
        assert_eq!(target, 9.0);

        let q = values(&[("q", QuantityValue::ok(3.0))]);
        let max = aggregate([("q", ObjectiveKind::Maximize)], &q, SumPolicy::Simple).unwrap();
        assert_eq!(max, -3.0);
    }

    #[test]
    fn squares_keep_sign_convention() {
        assert_eq!(contribution(ObjectiveKind::Minimize, -3.0, SumPolicy::Squares), 9.0);
        assert_eq!(contribution(ObjectiveKind::Maximize, -3.0, SumPolicy::Squares), -9.0);
        assert_eq!(
            contribution(ObjectiveKind::Target { value: 5.0 }, 2.0, SumPolicy::Squares),
            9.0
        );
        assert_eq!(contribution(ObjectiveKind::Target { value: 5.0 }, 2.0, SumPolicy::Simple), -3.0);
    }

    #[test]
    fn contributions_are_summed() {
        let q = values(&[("a", QuantityValue::ok(2.0)), ("b", QuantityValue::ok(1.0))]);
        let total = aggregate(
            [("a", ObjectiveKind::Minimize), ("b", ObjectiveKind::Maximize)],
            &q,
            SumPolicy::Squares,
        )
        .unwrap();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn every_nan_quantity_is_reported() {
        let q = values(&[
            ("a", QuantityValue::failed("empty list")),
            ("b", QuantityValue::ok(1.0)),
            ("c", QuantityValue::ok(f64::NAN)),
        ]);
        let err = aggregate(
            [
                ("a", ObjectiveKind::Minimize),
                ("b", ObjectiveKind::Minimize),
                ("c", ObjectiveKind::Minimize),
            ],
            &q,
            SumPolicy::Simple,
        )
        .unwrap_err();
        match err {
            EvaluationError::InvalidQuantities(messages) => {
                assert_eq!(messages.len(), 2);
                assert!(messages[0].starts_with("a =>"));
                assert!(messages[1].starts_with("c =>"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
