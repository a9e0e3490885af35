//! Post-hoc usage and billing reconciliation.

use super::client::CostSource;
use std::time::Duration;

/// Authoritative usage summed over every response of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostRecord {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

fn add_opt<T: std::ops::Add<Output = T>>(acc: Option<T>, value: Option<T>) -> Option<T> {
    match (acc, value) {
        (Some(a), Some(v)) => Some(a + v),
        (Some(a), None) => Some(a),
        (None, v) => v,
    }
}

/// Look up and sum the cost of every response id.
///
/// Each query waits `settle_delay` first. If any lookup is unavailable the
/// whole record is absent: a partial sum would understate the run.
pub async fn lookup_cost(
    source: &dyn CostSource,
    response_ids: &[String],
    settle_delay: Duration,
) -> Option<CostRecord> {
    if response_ids.is_empty() {
        return None;
    }

    let mut total = CostRecord::default();
    for id in response_ids {
        if !settle_delay.is_zero() {
            tokio::time::sleep(settle_delay).await;
        }
        let Some(cost) = source.generation_cost(id).await else {
            tracing::warn!(response_id = %id, "Cost lookup unavailable; keeping local token counts");
            return None;
        };
        total.prompt_tokens = add_opt(total.prompt_tokens, cost.prompt_tokens);
        total.completion_tokens = add_opt(total.completion_tokens, cost.completion_tokens);
        total.cost_usd = add_opt(total.cost_usd, cost.cost_usd);
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::GenerationCost;
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeCosts {
        costs: HashMap<String, GenerationCost>,
        queried: Mutex<Vec<String>>,
    }

    impl CostSource for FakeCosts {
        fn generation_cost<'a>(&'a self, response_id: &'a str) -> BoxFuture<'a, Option<GenerationCost>> {
            self.queried.lock().unwrap().push(response_id.to_string());
            let cost = self.costs.get(response_id).cloned();
            Box::pin(async move { cost })
        }
    }

    fn fake(entries: &[(&str, u64, u64, f64)]) -> FakeCosts {
        FakeCosts {
            costs: entries
                .iter()
                .map(|(id, p, c, usd)| {
                    (
                        id.to_string(),
                        GenerationCost {
                            prompt_tokens: Some(*p),
                            completion_tokens: Some(*c),
                            cost_usd: Some(*usd),
                        },
                    )
                })
                .collect(),
            queried: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_lookup_sums_all_responses() {
        let source = fake(&[("gen-1", 100, 10, 0.25), ("gen-2", 300, 20, 0.5)]);
        let ids = vec!["gen-1".to_string(), "gen-2".to_string()];
        let record = lookup_cost(&source, &ids, Duration::ZERO).await.unwrap();
        assert_eq!(record.prompt_tokens, Some(400));
        assert_eq!(record.completion_tokens, Some(30));
        assert_eq!(record.cost_usd, Some(0.75));
        assert_eq!(*source.queried.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn test_lookup_absent_when_any_response_missing() {
        let source = fake(&[("gen-1", 100, 10, 0.1)]);
        let ids = vec!["gen-1".to_string(), "gen-missing".to_string()];
        assert!(lookup_cost(&source, &ids, Duration::ZERO).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_without_responses_is_absent() {
        let source = fake(&[]);
        assert!(lookup_cost(&source, &[], Duration::ZERO).await.is_none());
        assert!(source.queried.lock().unwrap().is_empty());
    }
}
