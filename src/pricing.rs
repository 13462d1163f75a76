//! Static per-(provider, model) pricing table and cost computation (spec §4.1).

use crate::message::CostResult;

/// `[input_per_1k_usd, output_per_1k_usd]` lookup. Ollama is intentionally
/// absent — it is forced to zero cost regardless of lookup (spec §8
/// invariant 6).
fn lookup(provider: &str, model: &str) -> Option<(f64, f64)> {
    match (provider, model) {
        ("anthropic", "claude-sonnet-4-20250514") => Some((0.003, 0.015)),
        ("anthropic", "claude-haiku-4-20250514") => Some((0.0008, 0.004)),
        ("anthropic", "claude-opus-4-20250514") => Some((0.015, 0.075)),
        ("openai", "gpt-4o") => Some((0.0025, 0.01)),
        ("openai", "gpt-4") => Some((0.03, 0.06)),
        ("openai", "gpt-4o-mini") => Some((0.00015, 0.0006)),
        ("google", "gemini-1.5-flash") => Some((0.000075, 0.0003)),
        ("google", "gemini-1.5-pro") => Some((0.00125, 0.005)),
        ("deepseek", "deepseek-chat") => Some((0.00014, 0.00028)),
        _ => None,
    }
}

/// Computes `cost_usd = (prompt_tokens/1000)*input + (completion_tokens/1000)*output`.
/// Local (Ollama) is forced to zero. Unknown provider or model yields zero
/// with a warn log (spec §4.1, §8 invariants 6 and 7).
pub fn compute_cost(provider: &str, model: &str, prompt_tokens: u32, completion_tokens: u32) -> CostResult {
    if provider == "ollama" {
        return CostResult::zero();
    }

    match lookup(provider, model) {
        Some((input_rate, output_rate)) => {
            let input_cost = (prompt_tokens as f64 / 1000.0) * input_rate;
            let output_cost = (completion_tokens as f64 / 1000.0) * output_rate;
            CostResult::new(input_cost, output_cost)
        }
        None => {
            log::warn!("no pricing entry for {provider}/{model}; cost recorded as 0");
            CostResult::zero()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s8_cost_correctness() {
        let cost = compute_cost("anthropic", "claude-sonnet-4-20250514", 1000, 1000);
        assert!((cost.cost_usd - 0.018).abs() < 1e-10);
        assert!((cost.breakdown.input - 0.003).abs() < 1e-10);
        assert!((cost.breakdown.output - 0.015).abs() < 1e-10);
    }

    #[test]
    fn test_ollama_always_zero() {
        let cost = compute_cost("ollama", "llama3:70b", 100_000, 100_000);
        assert_eq!(cost.cost_usd, 0.0);
    }

    #[test]
    fn test_unknown_model_yields_zero() {
        let cost = compute_cost("openai", "some-future-model", 1000, 1000);
        assert_eq!(cost.cost_usd, 0.0);
    }

    #[test]
    fn test_unknown_provider_yields_zero() {
        let cost = compute_cost("mystery-provider", "model-x", 1000, 1000);
        assert_eq!(cost.cost_usd, 0.0);
    }
}
