//! Routing policy: task signals -> model, search flag, loop budget.
//!
//! Pure and deterministic given the request and `RoutingConfig`. Rules are
//! evaluated in order and the first match wins.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::tokens::estimate_tokens;

pub const POLICY_VERSION: &str = "routing-v1";

/// Fixed prompt overhead added to every routing estimate.
const PROMPT_OVERHEAD_TOKENS: usize = 500;

static COMPLEX_LEXICON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(prd|epic|artifact|acceptance criteria|requirements)")
        .expect("complex lexicon regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Low,
    #[default]
    Normal,
    High,
}

impl FromStr for PrivacyLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(anyhow!("unknown privacy level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Low,
    #[default]
    Standard,
    High,
}

impl FromStr for CostTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "standard" | "medium" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(anyhow!("unknown cost tier '{other}'")),
        }
    }
}

/// Signals describing one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequest {
    /// Prompt or concatenated messages.
    pub text: String,
    pub research_requested: bool,
    pub requires_live_data: bool,
    pub privacy_level: PrivacyLevel,
    pub max_cost_tier: CostTier,
}

impl RouteRequest {
    pub fn for_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn search_requested(&self) -> bool {
        self.research_requested || self.requires_live_data
    }
}

/// Why a route was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    PrivacyHigh,
    LowCostSearch,
    LowCost,
    SmallSimpleTask,
    ComplexLexicon,
    LiveSearch,
    TokenEstimateExceeded,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PrivacyHigh => "privacy_high",
            Self::LowCostSearch => "low_cost_search",
            Self::LowCost => "low_cost",
            Self::SmallSimpleTask => "small_simple_task",
            Self::ComplexLexicon => "complex_lexicon",
            Self::LiveSearch => "live_search",
            Self::TokenEstimateExceeded => "token_estimate_exceeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub model_id: String,
    pub use_live_search: bool,
    /// Extra loops allowed after the first attempt; `None` means unlimited.
    pub max_loops: Option<u32>,
    pub reason: RouteReason,
    pub policy_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub local_model: String,
    pub complex_model: String,
    /// Tasks estimated below this many tokens may stay on the local model.
    pub token_threshold: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_model: "ollama".to_string(),
            complex_model: "grok-4.1".to_string(),
            token_threshold: 2_000,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_model.trim().is_empty() || self.complex_model.trim().is_empty() {
            return Err(anyhow!("routing models must be non-empty"));
        }
        if self.token_threshold == 0 {
            return Err(anyhow!("routing.token_threshold must be > 0"));
        }
        Ok(())
    }
}

/// Routing estimate: `ceil(chars / 3.5) + 500`.
pub fn routing_estimate(text: &str) -> usize {
    estimate_tokens(text) + PROMPT_OVERHEAD_TOKENS
}

pub fn matches_complex_lexicon(text: &str) -> bool {
    COMPLEX_LEXICON.is_match(text)
}

/// Pick a model for `request`.
pub fn route(request: &RouteRequest, config: &RoutingConfig) -> Decision {
    let local = |max_loops, reason| Decision {
        model_id: config.local_model.clone(),
        use_live_search: false,
        max_loops,
        reason,
        policy_version: POLICY_VERSION.to_string(),
    };
    let complex = |use_live_search, max_loops, reason| Decision {
        model_id: config.complex_model.clone(),
        use_live_search,
        max_loops,
        reason,
        policy_version: POLICY_VERSION.to_string(),
    };

    if request.privacy_level == PrivacyLevel::High {
        return local(Some(0), RouteReason::PrivacyHigh);
    }

    let search = request.search_requested();
    if request.max_cost_tier == CostTier::Low {
        if search {
            return complex(true, Some(1), RouteReason::LowCostSearch);
        }
        return local(None, RouteReason::LowCost);
    }

    let estimate = routing_estimate(&request.text);
    let complex_text = matches_complex_lexicon(&request.text);
    if estimate < config.token_threshold && !search && !complex_text {
        return local(None, RouteReason::SmallSimpleTask);
    }

    let reason = if complex_text {
        RouteReason::ComplexLexicon
    } else if search {
        RouteReason::LiveSearch
    } else {
        RouteReason::TokenEstimateExceeded
    };
    complex(search, None, reason)
}
