//! Test filter resolution.
//!
//! Platforms and applications carry filter lists. A filter either disables
//! the whole run or excludes one case (or every case) of one target, and may
//! be limited to one build configuration:
//!
//! ```toml
//! [[platforms.linux-x64x11.filters]]
//! target = "nplb"
//! test = "SbSocketTest.SunnyDay"
//! config = "devel"
//!
//! [[platforms.linux-x64x11.filters]]
//! target = "renderer_test"
//! test = "*"
//!
//! [[platforms.raspi-2.filters]]
//! sentinel = "DISABLE_TESTING"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sentinel disabling testing for a platform; the run succeeds with no targets.
pub const DISABLE_TESTING: &str = "DISABLE_TESTING";

/// Sentinel dropping every target, or every case of one target.
pub const FILTER_ALL: &str = "FILTER_ALL";

/// A single entry of a filter list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub enum TestFilter {
    /// Do not test this platform at all.
    DisableTesting,
    /// Drop every target.
    FilterAll,
    /// Exclude `test` from `target`. `test` equal to `"*"` or
    /// [`FILTER_ALL`] drops the target.
    Exclude {
        /// Target the exclusion applies to.
        target: String,
        /// Case name, or a whole-target marker.
        test: String,
        /// Build configuration the filter is limited to.
        config: Option<String>,
    },
}

impl TestFilter {
    /// Convenience constructor for an unconditional exclusion.
    pub fn exclude(target: impl Into<String>, test: impl Into<String>) -> Self {
        TestFilter::Exclude {
            target: target.into(),
            test: test.into(),
            config: None,
        }
    }

    /// Whether the filter applies to build configuration `config`.
    pub fn applies_to(&self, config: &str) -> bool {
        match self {
            TestFilter::Exclude {
                config: Some(only), ..
            } => only == config,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sentinel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<String>,
}

impl TryFrom<RawFilter> for TestFilter {
    type Error = String;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        match (raw.sentinel, raw.target, raw.test) {
            (Some(sentinel), None, None) => match sentinel.as_str() {
                DISABLE_TESTING => Ok(TestFilter::DisableTesting),
                FILTER_ALL => Ok(TestFilter::FilterAll),
                other => Err(format!("unknown filter sentinel {:?}", other)),
            },
            (Some(_), _, _) => Err("a filter sentinel cannot name a target or test".to_string()),
            (None, Some(target), Some(test)) => Ok(TestFilter::Exclude {
                target,
                test,
                config: raw.config,
            }),
            (None, _, _) => Err("a filter needs both `target` and `test`".to_string()),
        }
    }
}

impl From<TestFilter> for RawFilter {
    fn from(filter: TestFilter) -> Self {
        match filter {
            TestFilter::DisableTesting => RawFilter {
                sentinel: Some(DISABLE_TESTING.to_string()),
                ..Default::default()
            },
            TestFilter::FilterAll => RawFilter {
                sentinel: Some(FILTER_ALL.to_string()),
                ..Default::default()
            },
            TestFilter::Exclude {
                target,
                test,
                config,
            } => RawFilter {
                sentinel: None,
                target: Some(target),
                test: Some(test),
                config,
            },
        }
    }
}

/// Targets left after filtering, each with its excluded cases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResolution {
    /// Target name to excluded case names. An empty list runs every case.
    pub targets: BTreeMap<String, Vec<String>>,
    /// Set when a [`TestFilter::DisableTesting`] filter applied.
    pub testing_disabled: bool,
}

/// Applies `filters` to `candidates` for build configuration `config`.
///
/// Filters limited to another configuration are ignored. Exclusions for
/// targets that are not candidates are dropped.
pub fn resolve_targets(
    candidates: &[String],
    filters: &[TestFilter],
    config: &str,
) -> FilterResolution {
    let mut targets: BTreeMap<String, Vec<String>> = candidates
        .iter()
        .map(|name| (name.clone(), Vec::new()))
        .collect();

    for filter in filters.iter().filter(|f| f.applies_to(config)) {
        match filter {
            TestFilter::DisableTesting => {
                return FilterResolution {
                    targets: BTreeMap::new(),
                    testing_disabled: true,
                };
            }
            TestFilter::FilterAll => {
                return FilterResolution::default();
            }
            TestFilter::Exclude { target, test, .. } => {
                if test == "*" || test == FILTER_ALL {
                    targets.remove(target);
                } else if let Some(excluded) = targets.get_mut(target)
                    && !excluded.contains(test)
                {
                    excluded.push(test.clone());
                }
            }
        }
    }

    FilterResolution {
        targets,
        testing_disabled: false,
    }
}

/// Appends the filters of `extra` that `base` does not already contain.
pub fn merge_filters(base: &mut Vec<TestFilter>, extra: &[TestFilter]) {
    for filter in extra {
        if !base.contains(filter) {
            base.push(filter.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exclusions_and_whole_target_drop() {
        let filters = vec![
            TestFilter::exclude("nplb", "SbSocketTest.SunnyDay"),
            TestFilter::exclude("nplb", "SbAudioTest.Play"),
            TestFilter::exclude("renderer_test", "*"),
            TestFilter::exclude("not_a_candidate", "X.Y"),
        ];
        let resolution = resolve_targets(
            &names(&["nplb", "renderer_test", "base_unittests"]),
            &filters,
            "devel",
        );

        assert!(!resolution.testing_disabled);
        assert_eq!(
            resolution.targets.keys().cloned().collect::<Vec<_>>(),
            names(&["base_unittests", "nplb"])
        );
        assert_eq!(
            resolution.targets["nplb"],
            names(&["SbSocketTest.SunnyDay", "SbAudioTest.Play"])
        );
        assert!(resolution.targets["base_unittests"].is_empty());
    }

    #[test]
    fn test_config_mismatch_is_ignored() {
        let filters = vec![TestFilter::Exclude {
            target: "nplb".into(),
            test: FILTER_ALL.into(),
            config: Some("gold".into()),
        }];
        let resolution = resolve_targets(&names(&["nplb"]), &filters, "devel");
        assert!(resolution.targets.contains_key("nplb"));

        let resolution = resolve_targets(&names(&["nplb"]), &filters, "gold");
        assert!(resolution.targets.is_empty());
    }

    #[test]
    fn test_sentinels() {
        let resolution = resolve_targets(
            &names(&["nplb"]),
            &[TestFilter::DisableTesting],
            "devel",
        );
        assert!(resolution.testing_disabled);
        assert!(resolution.targets.is_empty());

        let resolution = resolve_targets(&names(&["nplb"]), &[TestFilter::FilterAll], "devel");
        assert!(!resolution.testing_disabled);
        assert!(resolution.targets.is_empty());
    }

    #[test]
    fn test_deserialize_filters() {
        #[derive(Deserialize)]
        struct Doc {
            filters: Vec<TestFilter>,
        }

        let doc: Doc = toml::from_str(
            r#"
            [[filters]]
            target = "nplb"
            test = "A.B"
            config = "qa"

            [[filters]]
            sentinel = "FILTER_ALL"
            "#,
        )
        .unwrap();
        assert_eq!(
            doc.filters,
            vec![
                TestFilter::Exclude {
                    target: "nplb".into(),
                    test: "A.B".into(),
                    config: Some("qa".into()),
                },
                TestFilter::FilterAll,
            ]
        );

        let bad: Result<Doc, _> = toml::from_str(
            r#"
            [[filters]]
            target = "nplb"
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_merge_filters_skips_duplicates() {
        let mut base = vec![TestFilter::exclude("nplb", "A.B")];
        merge_filters(
            &mut base,
            &[TestFilter::exclude("nplb", "A.B"), TestFilter::exclude("nplb", "C.D")],
        );
        assert_eq!(base.len(), 2);
    }
}
