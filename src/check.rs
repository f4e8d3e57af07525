//! Contract with the visual comparison engine.
//!
//! [`VisualCheck`] is what the coordinator submits captures to. The engine
//! itself lives elsewhere; [`SessionCheck`] is a local stand-in that keeps
//! baselines in a capture [`Session`] and compares against them.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use image::GenericImageView;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::AccountCredentials;
use crate::harness::types::{MatchLevel, TestParameters};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// No baseline existed, the capture became the baseline
    New,
    Passed,
    /// Differences need a human decision
    Unresolved,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub result_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("{message}")]
    Failed {
        message: String,
        /// Results page that exists despite the failure
        result_url: Option<String>,
    },

    #[error("image could not be decoded: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    pub fn result_url(&self) -> Option<&str> {
        match self {
            Self::Failed { result_url, .. } => result_url.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait VisualCheck: Send + Sync {
    /// Compare `image` (PNG) against the baseline identified by `params`.
    async fn run_check(
        &self,
        params: &TestParameters,
        image: &[u8],
        tag: &str,
        credentials: &AccountCredentials,
    ) -> Result<CheckOutcome, CheckError>;

    /// Close whatever the engine left open for `params`. Never fails.
    async fn abort(&self, params: &TestParameters);
}

struct Baseline {
    pixels: image::RgbaImage,
}

/// Baselines held in a capture session, keyed by parameter fingerprint.
pub struct SessionCheck {
    session: Session,
    baselines: Mutex<HashMap<String, Baseline>>,
    captures: Mutex<usize>,
}

impl SessionCheck {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            baselines: Mutex::new(HashMap::new()),
            captures: Mutex::new(0),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn baseline_count(&self) -> usize {
        self.baselines.lock().len()
    }
}

#[async_trait]
impl VisualCheck for SessionCheck {
    async fn run_check(
        &self,
        params: &TestParameters,
        image: &[u8],
        tag: &str,
        credentials: &AccountCredentials,
    ) -> Result<CheckOutcome, CheckError> {
        let decoded = image::load_from_memory(image)
            .map_err(|e| CheckError::Image(e.to_string()))?
            .to_rgba8();

        let sequence = {
            let mut captures = self.captures.lock();
            *captures += 1;
            *captures
        };
        let name = format!("{:04}_{}_{}_{}", sequence, params.app_name, params.test_name, tag);
        let path = self.session.write_capture(&name, image)?;
        let result_url = file_url(&path);

        let key = params.fingerprint();
        let status = {
            let mut baselines = self.baselines.lock();
            match baselines.get(&key) {
                None => {
                    baselines.insert(key, Baseline { pixels: decoded });
                    CheckStatus::New
                }
                Some(baseline) if same_image(params.match_level, &baseline.pixels, &decoded) => {
                    CheckStatus::Passed
                }
                Some(_) => CheckStatus::Unresolved,
            }
        };

        info!(
            app = %params.app_name,
            test = %params.test_name,
            account = credentials.account_id(),
            ?status,
            "check complete"
        );
        Ok(CheckOutcome { status, result_url })
    }

    async fn abort(&self, params: &TestParameters) {
        debug!(app = %params.app_name, test = %params.test_name, "check aborted");
    }
}

/// Strict and exact compare pixels, layout and content compare dimensions.
fn same_image(level: MatchLevel, baseline: &image::RgbaImage, capture: &image::RgbaImage) -> bool {
    match level {
        MatchLevel::Strict | MatchLevel::Exact => baseline.as_raw() == capture.as_raw()
            && baseline.dimensions() == capture.dimensions(),
        MatchLevel::Layout | MatchLevel::Content => baseline.dimensions() == capture.dimensions(),
    }
}

fn file_url(path: &Path) -> Option<String> {
    let absolute = std::path::absolute(path).ok()?;
    url::Url::from_file_path(absolute).ok().map(String::from)
}

/// Width and height of an encoded image.
pub fn image_dimensions(png: &[u8]) -> Result<(u32, u32), CheckError> {
    image::load_from_memory(png)
        .map(|img| img.dimensions())
        .map_err(|e| CheckError::Image(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Size;

    fn params(test_name: &str, level: MatchLevel) -> TestParameters {
        TestParameters {
            app_name: "example.com".to_string(),
            test_name: test_name.to_string(),
            branch_name: None,
            parent_branch_name: None,
            os: "Linux".to_string(),
            hosting_app: "Simulated".to_string(),
            inferred_environment: "useragent:test".to_string(),
            match_level: level,
            viewport_size: Size::new(40, 30),
            batch: None,
        }
    }

    fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([shade, shade, shade, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn credentials() -> AccountCredentials {
        AccountCredentials::Legacy {
            account_id: "acct".to_string(),
            api_key: "key".to_string(),
        }
    }

    fn check() -> (tempfile::TempDir, SessionCheck) {
        let base = tempfile::tempdir().unwrap();
        let check = SessionCheck::new(Session::in_base(base.path()));
        (base, check)
    }

    #[tokio::test]
    async fn test_first_capture_is_new_then_compared() {
        let (_base, check) = check();
        let p = params("/home", MatchLevel::Strict);

        let first = check.run_check(&p, &png(40, 30, 10), "tab", &credentials()).await.unwrap();
        assert_eq!(first.status, CheckStatus::New);
        assert!(first.result_url.unwrap().starts_with("file://"));

        let same = check.run_check(&p, &png(40, 30, 10), "tab", &credentials()).await.unwrap();
        assert_eq!(same.status, CheckStatus::Passed);

        let changed = check.run_check(&p, &png(40, 30, 200), "tab", &credentials()).await.unwrap();
        assert_eq!(changed.status, CheckStatus::Unresolved);
        assert_eq!(check.baseline_count(), 1);
        assert_eq!(check.session().list_captures().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_layout_level_ignores_pixel_changes() {
        let (_base, check) = check();
        let p = params("/home", MatchLevel::Layout);
        check.run_check(&p, &png(40, 30, 10), "tab", &credentials()).await.unwrap();
        let outcome = check.run_check(&p, &png(40, 30, 90), "tab", &credentials()).await.unwrap();
        assert_eq!(outcome.status, CheckStatus::Passed);
        let resized = check.run_check(&p, &png(41, 30, 90), "tab", &credentials()).await.unwrap();
        assert_eq!(resized.status, CheckStatus::Unresolved);
    }

    #[tokio::test]
    async fn test_distinct_parameters_have_distinct_baselines() {
        let (_base, check) = check();
        check
            .run_check(&params("/a", MatchLevel::Strict), &png(4, 4, 1), "t", &credentials())
            .await
            .unwrap();
        let other = check
            .run_check(&params("/b", MatchLevel::Strict), &png(4, 4, 99), "t", &credentials())
            .await
            .unwrap();
        assert_eq!(other.status, CheckStatus::New);
    }

    #[tokio::test]
    async fn test_garbage_image_is_rejected() {
        let (_base, check) = check();
        let err = check
            .run_check(&params("/a", MatchLevel::Strict), b"not a png", "t", &credentials())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Image(_)));
        assert_eq!(err.result_url(), None);
    }

    #[test]
    fn test_image_dimensions() {
        assert_eq!(image_dimensions(&png(7, 3, 0)).unwrap(), (7, 3));
    }
}
