//! Images and tunnel settings for generated workloads.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PREVIEW_IMAGE: &str = "docbot/godoc:0.0.1";
pub const DEFAULT_TUNNEL_IMAGE: &str = "docbot/ssh-client:0.0.2";
pub const DEFAULT_TUNNEL_HOST: &str = "serveo.net";
/// Port the preview server listens on inside the pod.
pub const DEFAULT_PREVIEW_PORT: u16 = 6060;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadOptions {
    pub preview_image: String,
    pub tunnel_image: String,
    /// Reverse-tunnel host; previews are served from `<subdomain>.<tunnel_host>`.
    pub tunnel_host: String,
    pub preview_port: u16,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            preview_image: DEFAULT_PREVIEW_IMAGE.to_owned(),
            tunnel_image: DEFAULT_TUNNEL_IMAGE.to_owned(),
            tunnel_host: DEFAULT_TUNNEL_HOST.to_owned(),
            preview_port: DEFAULT_PREVIEW_PORT,
        }
    }
}
