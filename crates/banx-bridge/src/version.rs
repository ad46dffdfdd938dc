//! Version information reported by the health check.

/// banx-bridge version from Cargo.toml
pub const BANX_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub banx: &'static str,
    /// Source revision, when the build recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            banx: BANX_VERSION,
            commit: option_env!("BANX_COMMIT").map(str::to_string),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        assert_eq!(VersionInfo::new().banx, BANX_VERSION);
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            banx: "0.4.0",
            commit: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "banx": "0.4.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_commit() {
        let info = VersionInfo {
            banx: "0.4.0",
            commit: None,
        }
        .with_commit("3f2c1ab");
        insta::assert_json_snapshot!(info, @r#"
        {
          "banx": "0.4.0",
          "commit": "3f2c1ab"
        }
        "#);
    }
}
