//! # 费用计算服务
//!
//! 基于模型单价计算请求配额成本：预扣估算与实际结算共用一张
//! 价格表。缓存命中的 prompt token 与推理 token 单独计价。

use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::relay::usage::Usage;
use crate::types::{QUOTA_PER_USD, QuotaAmount, TokenCount};

/// 单模型价格（USD / 1K tokens）
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
    /// 缓存命中的 prompt 价；缺省为 prompt 的 1/10
    #[serde(default)]
    pub cached_prompt: Option<f64>,
    /// 图像 token 价；缺省同 prompt
    #[serde(default)]
    pub image: Option<f64>,
}

impl ModelPrice {
    const fn new(prompt: f64, completion: f64) -> Self {
        Self {
            prompt,
            completion,
            cached_prompt: None,
            image: None,
        }
    }

    fn cached_prompt_price(&self) -> f64 {
        self.cached_prompt.unwrap_or(self.prompt * 0.1)
    }

    fn image_price(&self) -> f64 {
        self.image.unwrap_or(self.prompt)
    }
}

/// 未配置模型的兜底价
const FALLBACK_PRICE: ModelPrice = ModelPrice::new(0.002, 0.006);

/// 费用计算服务
pub struct PricingService {
    table: HashMap<String, ModelPrice>,
}

impl PricingService {
    /// 内置价格表 + `RELAY_MODEL_PRICES` JSON 覆盖
    #[must_use]
    pub fn from_env() -> Self {
        let mut table = builtin_table();
        if let Ok(raw) = env::var("RELAY_MODEL_PRICES") {
            match serde_json::from_str::<HashMap<String, ModelPrice>>(&raw) {
                Ok(overrides) => table.extend(overrides),
                Err(err) => {
                    crate::lwarn!(
                        "system",
                        crate::logging::LogStage::Configuration,
                        crate::logging::LogComponent::Pricing,
                        "price_override_invalid",
                        "RELAY_MODEL_PRICES 解析失败，已忽略",
                        error = %err
                    );
                }
            }
        }
        Self { table }
    }

    /// 模型单价；精确名优先，其次最长前缀，最后兜底价
    #[must_use]
    pub fn price_for(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.table.get(model) {
            return *price;
        }
        let mut best: Option<(&str, &ModelPrice)> = None;
        for (name, price) in &self.table {
            if model.starts_with(name.as_str()) {
                match best {
                    Some((current, _)) if current.len() >= name.len() => {}
                    _ => best = Some((name, price)),
                }
            }
        }
        best.map(|(_, price)| *price).unwrap_or(FALLBACK_PRICE)
    }

    /// 预扣估算：输入 prompt 估算 + 输出上限兜底
    #[must_use]
    pub fn estimate_pre_charge(
        &self,
        model: &str,
        prompt_tokens: TokenCount,
        max_output_tokens_hint: TokenCount,
    ) -> QuotaAmount {
        let price = self.price_for(model);
        let usd = price.prompt * f64::from(prompt_tokens) / 1000.0
            + price.completion * f64::from(max_output_tokens_hint) / 1000.0;
        to_quota(usd)
    }

    /// 实际结算：缓存命中部分按缓存价，推理 token 按输出价
    #[must_use]
    pub fn settle_cost(&self, model: &str, usage: &Usage) -> QuotaAmount {
        let price = self.price_for(model);
        let fresh_prompt = usage.prompt_tokens.saturating_sub(usage.cached_tokens);
        let usd = price.prompt * f64::from(fresh_prompt) / 1000.0
            + price.cached_prompt_price() * f64::from(usage.cached_tokens) / 1000.0
            + price.completion * f64::from(usage.completion_tokens) / 1000.0
            + price.image_price() * f64::from(usage.image_tokens) / 1000.0;
        to_quota(usd)
    }
}

/// USD -> 配额，向上取整；非零费用至少记 1
fn to_quota(usd: f64) -> QuotaAmount {
    if usd <= 0.0 {
        return 0;
    }
    let quota = (usd * QUOTA_PER_USD).ceil();
    #[allow(clippy::cast_possible_truncation)]
    let quota = quota as QuotaAmount;
    quota.max(1)
}

fn builtin_table() -> HashMap<String, ModelPrice> {
    let entries: &[(&str, ModelPrice)] = &[
        // OpenAI
        ("gpt-4o", ModelPrice::new(0.0025, 0.01)),
        ("gpt-4o-mini", ModelPrice::new(0.000_15, 0.0006)),
        ("gpt-4.1", ModelPrice::new(0.002, 0.008)),
        ("gpt-4.1-mini", ModelPrice::new(0.0004, 0.0016)),
        ("gpt-4-turbo", ModelPrice::new(0.01, 0.03)),
        ("gpt-3.5-turbo", ModelPrice::new(0.0005, 0.0015)),
        ("o1", ModelPrice::new(0.015, 0.06)),
        ("o3-mini", ModelPrice::new(0.0011, 0.0044)),
        ("text-embedding-3-small", ModelPrice::new(0.000_02, 0.0)),
        ("text-embedding-3-large", ModelPrice::new(0.000_13, 0.0)),
        // Anthropic
        ("claude-3-5-sonnet", ModelPrice::new(0.003, 0.015)),
        ("claude-3-5-haiku", ModelPrice::new(0.0008, 0.004)),
        ("claude-3-opus", ModelPrice::new(0.015, 0.075)),
        ("claude-sonnet-4", ModelPrice::new(0.003, 0.015)),
        // Google
        ("gemini-1.5-pro", ModelPrice::new(0.001_25, 0.005)),
        ("gemini-1.5-flash", ModelPrice::new(0.000_075, 0.0003)),
        ("gemini-2.0-flash", ModelPrice::new(0.0001, 0.0004)),
    ];
    entries
        .iter()
        .map(|(name, price)| ((*name).to_string(), *price))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PricingService {
        PricingService {
            table: builtin_table(),
        }
    }

    #[test]
    fn exact_match_beats_prefix() {
        let pricing = service();
        let mini = pricing.price_for("gpt-4o-mini");
        let full = pricing.price_for("gpt-4o");
        assert!(mini.prompt < full.prompt);
    }

    #[test]
    fn prefix_match_resolves_dated_models() {
        let pricing = service();
        let dated = pricing.price_for("claude-3-5-sonnet-20241022");
        let base = pricing.price_for("claude-3-5-sonnet");
        assert_eq!(dated.prompt, base.prompt);
    }

    #[test]
    fn unknown_model_uses_fallback() {
        let pricing = service();
        let price = pricing.price_for("totally-unknown-model");
        assert_eq!(price.prompt, FALLBACK_PRICE.prompt);
    }

    #[test]
    fn settle_cost_prices_cached_tokens_cheaper() {
        let pricing = service();
        let full = pricing.settle_cost(
            "gpt-4o",
            &Usage {
                prompt_tokens: 1000,
                completion_tokens: 0,
                ..Usage::default()
            },
        );
        let cached = pricing.settle_cost(
            "gpt-4o",
            &Usage {
                prompt_tokens: 1000,
                cached_tokens: 1000,
                completion_tokens: 0,
                ..Usage::default()
            },
        );
        assert!(cached < full);
        assert!(cached > 0);
    }

    #[test]
    fn pre_charge_scales_with_output_hint() {
        let pricing = service();
        let small = pricing.estimate_pre_charge("gpt-4o-mini", 100, 256);
        let large = pricing.estimate_pre_charge("gpt-4o-mini", 100, 4096);
        assert!(large > small);
        assert!(small >= 1);
    }

    #[test]
    fn zero_usage_costs_nothing() {
        let pricing = service();
        assert_eq!(pricing.settle_cost("gpt-4o", &Usage::default()), 0);
    }
}
