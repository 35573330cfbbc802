use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, TransportError};

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u16,
    pub height: u16,
}

impl Geometry {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Messages from client to the remote process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Stdin { data: String },
    Resize { data: Geometry },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Messages from the remote process to the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Stdout {
        #[serde(default)]
        data: String,
    },
    Stderr {
        #[serde(default)]
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode", default)]
        exit_code: i32,
    },
    Error {
        #[serde(default)]
        error: String,
    },
}

pub fn parse_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e, text))
}

/// Identifies the terminal a session drives: at most one session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub target: String,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub alloc_id: String,
    pub task: String,
    pub command: Vec<String>,
    pub tty: bool,
}

impl ExecRequest {
    pub fn new(alloc_id: impl Into<String>, task: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            alloc_id: alloc_id.into(),
            task: task.into(),
            command,
            tty: true,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            target: self.alloc_id.clone(),
            task: self.task.clone(),
        }
    }

    /// `{ws_base}/v1/client/allocation/{alloc}/exec?task=..&command=<json>&tty=..`
    pub fn url(&self, ws_base: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(ws_base.trim_end_matches('/'))
            .map_err(|e| TransportError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| TransportError::Url(format!("{ws_base} cannot be a base")))?
            .pop_if_empty()
            .extend(["v1", "client", "allocation", self.alloc_id.as_str(), "exec"]);
        let command = serde_json::to_string(&self.command)
            .map_err(|e| TransportError::Url(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("task", &self.task)
            .append_pair("command", &command)
            .append_pair("tty", if self.tty { "true" } else { "false" });
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn client_frames_match_wire_shape() {
        let stdin: Value = serde_json::from_str(
            &ClientFrame::Stdin {
                data: "ls\r".into(),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(stdin, json!({"type": "stdin", "data": "ls\r"}));

        let resize: Value = serde_json::from_str(
            &ClientFrame::Resize {
                data: Geometry::new(120, 40),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(
            resize,
            json!({"type": "resize", "data": {"width": 120, "height": 40}})
        );
    }

    #[test]
    fn server_frames_parse() {
        assert_eq!(
            parse_server_frame(r#"{"type":"stdout","data":"hi"}"#).unwrap(),
            ServerFrame::Stdout { data: "hi".into() }
        );
        assert_eq!(
            parse_server_frame(r#"{"type":"stderr","data":"oops"}"#).unwrap(),
            ServerFrame::Stderr {
                data: "oops".into()
            }
        );
        assert_eq!(
            parse_server_frame(r#"{"type":"exit","exitCode":3}"#).unwrap(),
            ServerFrame::Exit { exit_code: 3 }
        );
        assert_eq!(
            parse_server_frame(r#"{"type":"error","error":"no such task"}"#).unwrap(),
            ServerFrame::Error {
                error: "no such task".into()
            }
        );
    }

    #[test]
    fn unparseable_frames_keep_raw_text() {
        let err = parse_server_frame("plain text").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { raw, .. } if raw == "plain text"));
        assert!(parse_server_frame(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn exec_url_encodes_command_as_json() {
        let request = ExecRequest::new("a1", "web", vec!["/bin/sh".into(), "-c".into(), "ls".into()]);
        let url = request.url("ws://127.0.0.1:4646/").unwrap();
        assert_eq!(url.path(), "/v1/client/allocation/a1/exec");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("task".to_string(), "web".to_string()),
                ("command".to_string(), r#"["/bin/sh","-c","ls"]"#.to_string()),
                ("tty".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn session_key_is_alloc_and_task() {
        let request = ExecRequest::new("a1", "web", vec![]);
        assert_eq!(
            request.key(),
            SessionKey {
                target: "a1".into(),
                task: "web".into()
            }
        );
    }
}
