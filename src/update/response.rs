//! Update metadata as returned by the control server.
//!
//! Two shapes are accepted:
//! ```json
//! { "md5": "…", "url": "http://…/script.lua" }
//! [ { "md5": "…", "url": "…", "projectID": "alpha" }, … ]
//! ```

use serde::Deserialize;

/// Checksum and location of the current script.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Hex MD5 of the script content.
    pub md5: String,
    /// Where to fetch the content from.
    pub url: String,
    /// Project the entry belongs to (multi-project responses only).
    #[serde(default, rename = "projectID")]
    pub project_id: Option<String>,
}

/// Either shape of the update response.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum UpdateResponse {
    /// Single-script deployment.
    Single(UpdateConfig),
    /// One entry per project.
    Projects(Vec<UpdateConfig>),
}

impl UpdateResponse {
    /// Picks the entry for `project`.
    ///
    /// `None` selects the single entry or the first project.
    pub fn select(self, project: Option<&str>) -> Option<UpdateConfig> {
        match (self, project) {
            (UpdateResponse::Single(cfg), _) => Some(cfg),
            (UpdateResponse::Projects(all), None) => all.into_iter().next(),
            (UpdateResponse::Projects(all), Some(p)) => all
                .into_iter()
                .find(|c| c.project_id.as_deref() == Some(p)),
        }
    }
}
