//! Where log chunks come from.

use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Url;
use std::fmt;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogKind {
    #[default]
    Stdout,
    Stderr,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the file `offset` counts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Start,
    End,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub alloc_id: String,
    pub task: String,
    pub kind: LogKind,
    pub follow: bool,
    pub origin: Origin,
    /// Byte offset from `origin`.
    pub offset: u64,
}

impl LogRequest {
    pub fn new(alloc_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            alloc_id: alloc_id.into(),
            task: task.into(),
            kind: LogKind::Stdout,
            follow: true,
            origin: Origin::Start,
            offset: 0,
        }
    }

    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("task", self.task.clone()),
            ("type", self.kind.as_str().to_string()),
            ("follow", self.follow.to_string()),
            ("origin", self.origin.as_str().to_string()),
            ("offset", self.offset.to_string()),
        ]
    }

    /// Default export name, e.g. `3f2a-web-stdout-20260101-120000.log`.
    pub fn suggested_file_name(&self) -> String {
        self.file_name_at(&Local::now())
    }

    pub fn file_name_at<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> String
    where
        Tz::Offset: fmt::Display,
    {
        format!(
            "{}-{}-{}-{}.log",
            sanitize(&self.alloc_id),
            sanitize(&self.task),
            self.kind,
            at.format("%Y%m%d-%H%M%S")
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens one streaming response per request. Dropping the stream cancels it.
pub trait LogSource: Send + Sync + 'static {
    fn open(&self, request: &LogRequest) -> ChunkStream;
}

/// Streams `{base}/v1/client/fs/logs/{alloc_id}` over HTTP.
#[derive(Clone)]
pub struct HttpLogSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLogSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, request: &LogRequest) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| TransportError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| TransportError::Url(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "client", "fs", "logs", request.alloc_id.as_str()]);
        url.query_pairs_mut().extend_pairs(request.query_params());
        Ok(url)
    }
}

impl LogSource for HttpLogSource {
    fn open(&self, request: &LogRequest) -> ChunkStream {
        let url = match self.endpoint(request) {
            Ok(url) => url,
            Err(e) => return stream::once(async move { Err::<Bytes, _>(e) }).boxed(),
        };
        let pending = self.client.get(url).send();

        stream::once(async move {
            let response = pending.await.map_err(TransportError::from_reqwest)?;
            let response = response
                .error_for_status()
                .map_err(TransportError::from_reqwest)?;
            Ok::<_, TransportError>(response.bytes_stream().map_err(TransportError::from_reqwest))
        })
        .try_flatten()
        .boxed()
    }
}
