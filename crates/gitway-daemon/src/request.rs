//! The `git://` request line.
//!
//! The first pkt-line a client sends names the service and repository:
//! `git-upload-pack /path\0host=example.com\0\0version=1\0`.

use crate::error::{DaemonError, Result};
use gitway_git::ServiceKind;

/// A parsed daemon request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRequest {
    /// Requested service.
    pub service: ServiceKind,
    /// Repository path with the leading slash removed.
    pub path: String,
    /// Value of the `host=` parameter, without any port.
    pub host: Option<String>,
    /// Extra parameters after the double NUL, such as `version=1`.
    pub extra: Vec<String>,
}

impl DaemonRequest {
    /// Parses the payload of the first pkt-line.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let invalid = |msg: &str| DaemonError::InvalidRequest(msg.to_string());
        let line = std::str::from_utf8(line).map_err(|_| invalid("request is not utf-8"))?;
        let line = line.strip_suffix('\n').unwrap_or(line);

        let mut fields = line.split('\0');
        let command = fields.next().unwrap_or_default();
        let (service, path) = command
            .split_once(' ')
            .ok_or_else(|| invalid("missing repository path"))?;
        let service: ServiceKind = service
            .parse()
            .map_err(|_| invalid(&format!("unknown service {}", service)))?;
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(invalid("empty repository path"));
        }

        let mut host = None;
        let mut extra = Vec::new();
        let mut after_separator = false;
        for field in fields {
            if field.is_empty() {
                after_separator = true;
                continue;
            }
            if after_separator {
                extra.push(field.to_string());
            } else if let Some(value) = field.strip_prefix("host=") {
                host = Some(value.split(':').next().unwrap_or(value).to_string());
            }
        }

        Ok(Self {
            service,
            path: path.to_string(),
            host,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_request() {
        let req =
            DaemonRequest::parse(b"git-upload-pack /alice/app.git\0host=example.com:9418\0\0version=1\0")
                .unwrap();
        assert_eq!(req.service, ServiceKind::UploadPack);
        assert_eq!(req.path, "alice/app.git");
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.extra, vec!["version=1"]);
    }

    #[test]
    fn test_parse_minimal_request() {
        let req = DaemonRequest::parse(b"git-receive-pack /r\n").unwrap();
        assert_eq!(req.service, ServiceKind::ReceivePack);
        assert_eq!(req.path, "r");
        assert!(req.host.is_none());
        assert!(req.extra.is_empty());
    }

    #[test]
    fn test_rejects_bad_requests() {
        assert!(DaemonRequest::parse(b"git-upload-pack").is_err());
        assert!(DaemonRequest::parse(b"git-upload-archive /r\0").is_err());
        assert!(DaemonRequest::parse(b"git-upload-pack /\0").is_err());
        assert!(DaemonRequest::parse(&[0xff, 0xfe]).is_err());
    }
}
