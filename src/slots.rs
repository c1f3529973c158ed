//! Tensor slot resolution.
//!
//! Stage models come from different export paths. Older exports prefix every
//! tensor with `serving_default_` and a `:0` suffix; current exports use bare
//! names like `x` or `cross_attn_cond`. Some exports carry no useful names at
//! all, in which case the positional layout of the first export applies.
//!
//! Each [`SlotRole`] owns a static [`SlotRule`]: tiers of name patterns tried
//! in order (first tensor matching any pattern of a tier wins) and an optional
//! positional fallback.

use std::fmt;

use crate::runtime::TensorInfo;
use crate::stage::StageKind;
use crate::{Error, Result};

/// Semantic role of a tensor within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRole {
    TokenIds,
    AttentionMask,
    Duration,
    CrossAttentionOut,
    GlobalConditioningOut,
    DiffusionInput,
    DiffusionTime,
    CrossAttentionIn,
    GlobalConditioningIn,
    DiffusionOutput,
    LatentIn,
    AudioOut,
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotRole::TokenIds => "ids",
            SlotRole::AttentionMask => "attention-mask",
            SlotRole::Duration => "duration",
            SlotRole::CrossAttentionOut => "cross-attention-conditioning (out)",
            SlotRole::GlobalConditioningOut => "global-conditioning (out)",
            SlotRole::DiffusionInput => "diffusion-input",
            SlotRole::DiffusionTime => "diffusion-time",
            SlotRole::CrossAttentionIn => "cross-attention-conditioning (in)",
            SlotRole::GlobalConditioningIn => "global-conditioning (in)",
            SlotRole::DiffusionOutput => "diffusion-output",
            SlotRole::LatentIn => "latent",
            SlotRole::AudioOut => "audio",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// How a candidate string is compared against a tensor name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePattern {
    Exact(&'static str),
    Contains(&'static str),
}

impl NamePattern {
    fn matches(self, name: &str) -> bool {
        match self {
            NamePattern::Exact(p) => name == p,
            NamePattern::Contains(p) => name.contains(p),
        }
    }
}

/// Static lookup rule for one role.
#[derive(Debug, Clone, Copy)]
pub struct SlotRule {
    pub direction: Direction,
    pub tiers: &'static [&'static [NamePattern]],
    pub fallback: Option<usize>,
    pub required: bool,
}

use NamePattern::{Contains, Exact};

impl SlotRole {
    pub fn rule(self) -> SlotRule {
        use Direction::{Input, Output};
        match self {
            SlotRole::TokenIds => SlotRule {
                direction: Input,
                tiers: &[&[Contains("input_ids"), Contains("ids")]],
                fallback: Some(0),
                required: true,
            },
            SlotRole::AttentionMask => SlotRule {
                direction: Input,
                tiers: &[&[Contains("attention_mask"), Contains("attn_mask")]],
                fallback: Some(1),
                required: true,
            },
            SlotRole::Duration => SlotRule {
                direction: Input,
                tiers: &[&[Contains("seconds_total"), Contains("time"), Contains("duration")]],
                fallback: Some(2),
                required: true,
            },
            SlotRole::CrossAttentionOut => SlotRule {
                direction: Output,
                tiers: &[&[
                    Contains("cross_attn"),
                    Contains("encoder_hidden"),
                    Contains("conditioning"),
                ]],
                fallback: Some(0),
                required: true,
            },
            SlotRole::GlobalConditioningOut => SlotRule {
                direction: Output,
                tiers: &[&[Contains("global_cond"), Contains("global")]],
                fallback: Some(2),
                required: false,
            },
            SlotRole::DiffusionInput => SlotRule {
                direction: Input,
                tiers: &[
                    &[Contains("_x:"), Contains("_x"), Contains("x:")],
                    &[Exact("x")],
                    &[Contains("x")],
                ],
                fallback: None,
                required: true,
            },
            SlotRole::DiffusionTime => SlotRule {
                direction: Input,
                tiers: &[
                    &[Contains("_t:"), Contains("_t"), Contains("t:")],
                    &[Exact("t")],
                    &[Contains("t")],
                ],
                fallback: None,
                required: true,
            },
            SlotRole::CrossAttentionIn => SlotRule {
                direction: Input,
                tiers: &[&[Contains("cross_attn"), Contains("crossattn")]],
                fallback: None,
                required: true,
            },
            SlotRole::GlobalConditioningIn => SlotRule {
                direction: Input,
                tiers: &[&[Contains("global_cond"), Contains("globalcond")]],
                fallback: None,
                required: false,
            },
            SlotRole::DiffusionOutput => SlotRule {
                direction: Output,
                tiers: &[],
                fallback: Some(0),
                required: true,
            },
            SlotRole::LatentIn => SlotRule {
                direction: Input,
                tiers: &[],
                fallback: Some(0),
                required: true,
            },
            SlotRole::AudioOut => SlotRule {
                direction: Output,
                tiers: &[],
                fallback: Some(0),
                required: true,
            },
        }
    }
}

/// Export layout detected from tensor names, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// `serving_default_<name>:0` names.
    Legacy,
    /// Bare names.
    Current,
}

impl ExportFormat {
    pub fn detect(inputs: &[TensorInfo]) -> Self {
        if inputs.iter().any(|t| t.name.starts_with("serving_default_")) {
            ExportFormat::Legacy
        } else {
            ExportFormat::Current
        }
    }
}

/// Find a tensor for `rule` among `tensors`.
///
/// Returns the position within `tensors`, or `None` when neither a name nor
/// the positional fallback matches.
pub fn find(tensors: &[TensorInfo], rule: &SlotRule) -> Option<usize> {
    for tier in rule.tiers {
        for (idx, tensor) in tensors.iter().enumerate() {
            if tier.iter().any(|p| p.matches(&tensor.name)) {
                return Some(idx);
            }
        }
    }
    rule.fallback.filter(|&idx| idx < tensors.len())
}

/// A role bound to a concrete tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub role: SlotRole,
    pub index: usize,
    pub info: TensorInfo,
}

impl Slot {
    pub fn element_count(&self) -> usize {
        self.info.element_count()
    }
}

/// Resolve `role` against a graph's declared inputs/outputs.
///
/// Optional roles return `Ok(None)` when absent; required roles fail with
/// [`Error::SlotResolution`].
pub fn resolve(
    stage: StageKind,
    role: SlotRole,
    inputs: &[TensorInfo],
    outputs: &[TensorInfo],
) -> Result<Option<Slot>> {
    let rule = role.rule();
    let tensors = match rule.direction {
        Direction::Input => inputs,
        Direction::Output => outputs,
    };
    match find(tensors, &rule) {
        Some(index) => {
            let info = tensors[index].clone();
            tracing::debug!(%stage, %role, index, name = %info.name, dims = ?info.dims, "resolved tensor slot");
            Ok(Some(Slot { role, index, info }))
        }
        None if rule.required => Err(Error::SlotResolution { stage, role }),
        None => {
            tracing::info!(%stage, %role, "optional tensor slot not present in this export");
            Ok(None)
        }
    }
}

/// Resolve a required role.
pub fn require(
    stage: StageKind,
    role: SlotRole,
    inputs: &[TensorInfo],
    outputs: &[TensorInfo],
) -> Result<Slot> {
    resolve(stage, role, inputs, outputs)?.ok_or(Error::SlotResolution { stage, role })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TensorType;

    fn tensors(names: &[&str]) -> Vec<TensorInfo> {
        names
            .iter()
            .map(|n| TensorInfo::new(*n, TensorType::Float32, &[1]))
            .collect()
    }

    #[test]
    fn legacy_diffuser_names() {
        let inputs = tensors(&[
            "serving_default_cross_attn_cond:0",
            "serving_default_x:0",
            "serving_default_t:0",
            "serving_default_global_cond:0",
        ]);
        assert_eq!(ExportFormat::detect(&inputs), ExportFormat::Legacy);
        assert_eq!(find(&inputs, &SlotRole::DiffusionInput.rule()), Some(1));
        assert_eq!(find(&inputs, &SlotRole::DiffusionTime.rule()), Some(2));
        assert_eq!(find(&inputs, &SlotRole::CrossAttentionIn.rule()), Some(0));
        assert_eq!(find(&inputs, &SlotRole::GlobalConditioningIn.rule()), Some(3));
    }

    #[test]
    fn bare_time_name_wins_over_substring() {
        // `cross_attn_cond` contains a `t` but the exact tier comes first.
        let inputs = tensors(&["cross_attn_cond", "x", "t"]);
        assert_eq!(ExportFormat::detect(&inputs), ExportFormat::Current);
        assert_eq!(find(&inputs, &SlotRole::DiffusionTime.rule()), Some(2));
        assert_eq!(find(&inputs, &SlotRole::DiffusionInput.rule()), Some(1));
        assert_eq!(find(&inputs, &SlotRole::GlobalConditioningIn.rule()), None);
    }

    #[test]
    fn candidates_tried_in_priority_order() {
        // `ids` would match position 0 first, but `input_ids` is tried
        // across all tensors before it.
        let inputs = tensors(&["pad_ids", "input_ids"]);
        let rule = SlotRule {
            direction: Direction::Input,
            tiers: &[&[Contains("input_ids")], &[Contains("ids")]],
            fallback: None,
            required: true,
        };
        assert_eq!(find(&inputs, &rule), Some(1));
        // Within one tier, the first tensor matching any candidate wins.
        assert_eq!(find(&inputs, &SlotRole::TokenIds.rule()), Some(0));
    }

    #[test]
    fn positional_fallback() {
        let inputs = tensors(&["a", "b", "c"]);
        assert_eq!(find(&inputs, &SlotRole::TokenIds.rule()), Some(0));
        assert_eq!(find(&inputs, &SlotRole::AttentionMask.rule()), Some(1));

        let outputs = tensors(&["out0", "out1"]);
        // Fallback index past the end is treated as absent.
        assert_eq!(find(&outputs, &SlotRole::GlobalConditioningOut.rule()), None);
    }

    #[test]
    fn required_role_missing_is_an_error() {
        let inputs = tensors(&["x"]);
        let err = resolve(StageKind::Diffuser, SlotRole::CrossAttentionIn, &inputs, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::SlotResolution {
                role: SlotRole::CrossAttentionIn,
                ..
            }
        ));
        assert!(err.is_load_failure());
    }

    #[test]
    fn optional_role_missing_is_none() {
        let outputs = tensors(&["cross_attn_cond"]);
        let slot = resolve(StageKind::Encoder, SlotRole::GlobalConditioningOut, &[], &outputs).unwrap();
        assert!(slot.is_none());
    }
}
