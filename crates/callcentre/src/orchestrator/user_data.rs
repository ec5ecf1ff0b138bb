//! Boot-config (cloud-init user data) templating
//!
//! Templates are plain cloud-init documents with three placeholders:
//! `{{ machine_index }}`, `{{ callback_host }}` and `{{ callback_port }}`.
//! Whitespace inside the braces is optional. The template is parsed once at load time, so render
//! only fails on inputs that can never succeed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Template loading and rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to read template '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown placeholder '{{{{ {name} }}}}' at byte {offset}")]
    UnknownPlaceholder { name: String, offset: usize },

    #[error("unterminated placeholder at byte {offset}")]
    Unterminated { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    MachineIndex,
    CallbackHost,
    CallbackPort,
}

/// A parsed boot-config template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTemplate {
    segments: Vec<Segment>,
}

impl BootTemplate {
    /// Read and parse a template file
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let trimmed = source.trim_start();
        if !trimmed.starts_with("#cloud-config") && !trimmed.starts_with("#!") {
            warn!("Boot template does not start with '#cloud-config' or '#!'; cloud-init may ignore it");
        }

        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated { offset: offset + start })?;

            let name = after_open[..end].trim();
            segments.push(match name {
                "machine_index" => Segment::MachineIndex,
                "callback_host" => Segment::CallbackHost,
                "callback_port" => Segment::CallbackPort,
                other => {
                    return Err(TemplateError::UnknownPlaceholder {
                        name: other.to_string(),
                        offset: offset + start,
                    })
                }
            });

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Substitute the placeholders for one instance
    pub fn render(&self, machine_index: usize, callback_host: &str, callback_port: u16) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::MachineIndex => out.push_str(&machine_index.to_string()),
                Segment::CallbackHost => out.push_str(callback_host),
                Segment::CallbackPort => out.push_str(&callback_port.to_string()),
            }
        }
        out
    }

    /// Rendered document, base64 encoded for the create-instance call
    pub fn render_encoded(
        &self,
        machine_index: usize,
        callback_host: &str,
        callback_port: u16,
    ) -> String {
        STANDARD.encode(self.render(machine_index, callback_host, callback_port))
    }
}
