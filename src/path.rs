//! Addressing scheme for reviewer decisions: `/posts/{id}/toxic-resolution/{accept|rejected}`.
use thiserror::Error;

use crate::model::Action;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Invalid URL format. Expected /posts/{{post-id}}/toxic-resolution/accept or /posts/{{post-id}}/toxic-resolution/rejected")]
    InvalidFormat { received_parts: Vec<String> },
    #[error("Missing post-id in request path")]
    MissingId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPath {
    pub id: String,
    pub action: Action,
}

/// Non-empty `/`-separated segments of `path`.
pub fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn parse(path: &str) -> Result<ResolutionPath, PathError> {
    let parts = segments(path);
    let action = match parts.as_slice() {
        [posts, _, resolution, action] if posts == "posts" && resolution == "toxic-resolution" => {
            Action::parse(action)
        }
        _ => None,
    };
    let Some(action) = action else {
        return Err(PathError::InvalidFormat {
            received_parts: parts,
        });
    };

    let id = &parts[1];
    if id.is_empty() {
        return Err(PathError::MissingId);
    }
    Ok(ResolutionPath {
        id: id.clone(),
        action,
    })
}
