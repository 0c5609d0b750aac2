use crate::config::AssetRule;
use crate::error::{Error, Result};
use crate::platform::Platform;
use regex::Regex;

/// Picks the release asset for `platform` from `asset_names`.
///
/// Rules are filtered to the platform and tried in declaration order; the
/// first rule that matches anything decides. A rule matching more than one
/// asset is an error rather than a silent tie-break, and there is no fuzzy
/// fallback when nothing matches.
#[tracing::instrument(skip(asset_names, rules, platform), fields(platform = %platform))]
pub fn select_asset<S: AsRef<str>>(
    asset_names: &[S],
    rules: &[AssetRule],
    platform: &Platform,
) -> Result<String> {
    let applicable: Vec<&AssetRule> = rules.iter().filter(|r| r.applies_to(platform)).collect();
    if applicable.is_empty() {
        return Err(Error::UnsupportedPlatform {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        });
    }

    for rule in applicable {
        let re = Regex::new(&rule.pattern)
            .map_err(|e| Error::Config(format!("bad asset pattern '{}': {e}", rule.pattern)))?;
        let matches: Vec<&str> = asset_names
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| re.is_match(name))
            .collect();

        match matches.as_slice() {
            [] => {
                tracing::trace!(pattern = %rule.pattern, "Rule matched no assets");
            }
            [only] => {
                tracing::debug!(asset = only, pattern = %rule.pattern, "Selected release asset");
                return Ok((*only).to_string());
            }
            many => {
                return Err(Error::AmbiguousAsset {
                    pattern: rule.pattern.clone(),
                    matches: many.iter().map(|s| s.to_string()).collect(),
                });
            }
        }
    }

    Err(Error::NoMatchingAsset {
        os: platform.os.clone(),
        arch: platform.arch.clone(),
        candidates: asset_names.len(),
    })
}
