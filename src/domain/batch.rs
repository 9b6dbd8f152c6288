//! Validated compilation batches.
//!
//! A [`CompilationBatch`] only exists once the request shape has been checked against
//! [`BatchLimits`]; nothing downstream re-validates counts.

use std::collections::BTreeMap;

use amxforge_api_types::CompileRequest;

use super::error::BatchRejection;
use super::filenames::UnitName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_units: usize,
    pub max_includes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_units: 10,
            max_includes: 10,
        }
    }
}

/// One plugin to compile.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Zero-based position in the batch; also names the unit's build directory.
    pub index: usize,
    pub name: UnitName,
    pub code: String,
    /// Unit-private includes, unfiltered. Unsafe names are dropped when written.
    pub includes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompilationBatch {
    pub shared_includes: BTreeMap<String, String>,
    pub units: Vec<SourceUnit>,
}

impl CompilationBatch {
    /// Check the request against `limits` and produce a batch with sanitized unit names.
    pub fn from_request(
        request: CompileRequest,
        limits: &BatchLimits,
    ) -> Result<Self, BatchRejection> {
        let CompileRequest { includes, plugins } = request;

        if plugins.is_empty() {
            return Err(BatchRejection::NoUnits);
        }
        if plugins.len() > limits.max_units {
            return Err(BatchRejection::TooManyUnits {
                submitted: plugins.len(),
                max: limits.max_units,
            });
        }
        if includes.len() > limits.max_includes {
            return Err(BatchRejection::TooManyIncludes {
                submitted: includes.len(),
                max: limits.max_includes,
            });
        }

        let units = plugins
            .into_iter()
            .enumerate()
            .map(|(index, plugin)| SourceUnit {
                index,
                name: UnitName::sanitize(plugin.name.as_deref(), index + 1),
                code: plugin.code,
                includes: plugin.includes,
            })
            .collect();

        Ok(Self {
            shared_includes: includes,
            units,
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use amxforge_api_types::PluginSource;

    use super::*;

    fn request_with(units: usize, includes: usize) -> CompileRequest {
        CompileRequest {
            includes: (0..includes)
                .map(|i| (format!("shared_{i}.inc"), String::new()))
                .collect(),
            plugins: (0..units)
                .map(|i| PluginSource {
                    name: Some(format!("unit_{i}")),
                    code: "public plugin_init() {}".to_string(),
                    includes: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = CompilationBatch::from_request(request_with(0, 0), &BatchLimits::default())
            .expect_err("empty batch");
        assert_eq!(err, BatchRejection::NoUnits);
    }

    #[test]
    fn maximum_unit_count_is_accepted_and_one_more_rejected() {
        let limits = BatchLimits::default();
        let batch = CompilationBatch::from_request(request_with(10, 0), &limits)
            .expect("batch at the limit");
        assert_eq!(batch.len(), 10);

        let err = CompilationBatch::from_request(request_with(11, 0), &limits)
            .expect_err("batch over the limit");
        assert_eq!(
            err,
            BatchRejection::TooManyUnits {
                submitted: 11,
                max: 10
            }
        );
        assert_eq!(err.submitted(), Some(11));
    }

    #[test]
    fn too_many_shared_includes_is_rejected() {
        let limits = BatchLimits {
            max_units: 10,
            max_includes: 2,
        };
        let err = CompilationBatch::from_request(request_with(1, 3), &limits)
            .expect_err("too many includes");
        assert!(matches!(err, BatchRejection::TooManyIncludes { .. }));
        assert_eq!(err.limit(), Some(2));
    }

    #[test]
    fn rejections_have_distinct_messages() {
        let messages = [
            BatchRejection::NoUnits.to_string(),
            BatchRejection::TooManyUnits {
                submitted: 2,
                max: 1,
            }
            .to_string(),
            BatchRejection::TooManyIncludes {
                submitted: 2,
                max: 1,
            }
            .to_string(),
        ];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
        assert_ne!(messages[0], messages[2]);
    }

    #[test]
    fn unit_names_are_sanitized_with_positional_fallback() {
        let mut request = request_with(2, 0);
        request.plugins[1].name = Some("../../etc/passwd".to_string());
        request.plugins[0].name = None;

        let batch = CompilationBatch::from_request(request, &BatchLimits::default())
            .expect("valid batch");
        assert_eq!(batch.units[0].name.as_str(), "plugin_1");
        assert_eq!(batch.units[1].name.as_str(), "plugin_2");
        assert_eq!(batch.units[1].index, 1);
    }
}
