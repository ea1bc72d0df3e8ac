//! Well-known endpoint names, agreed upon by every process at build
//! time. A [`Namespace`] prefixes all of them so independent runs
//! (tests, mostly) cannot collide on the global IPC namespace.

pub const FRAME_FORMAT: &str = "format";
pub const FRAME: &str = "frame";
pub const DETECTIONS: &str = "faces";
pub const FPS_COMMANDS: &str = "fps";
pub const MODE_COMMANDS: &str = "mode";
pub const DETECT_RENDER_SYNC: &str = "sync";
pub const READY: &str = "ready";

pub const DEFAULT_NAMESPACE: &str = "redactd";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// `prefix` must not contain `/`; POSIX object names allow exactly
    /// one slash, the leading one we add ourselves.
    pub fn new(prefix: &str) -> Self {
        debug_assert!(!prefix.contains('/'));
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Full object name for an endpoint, e.g. `/redactd-frame`.
    pub fn object(&self, endpoint: &str) -> String {
        format!("/{}-{}", self.prefix, endpoint)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_rooted_and_prefixed() {
        let ns = Namespace::new("run42");
        assert_eq!(ns.object(FRAME), "/run42-frame");
        assert_eq!(Namespace::default().object(READY), "/redactd-ready");
    }
}
