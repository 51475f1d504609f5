// PanelSync - Offline Chapter Reader for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Chapter identity shared by the queue, the manager and the reader

use crate::error::{PanelSyncError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identity of a chapter download
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
    pub content_id: String,
    pub chapter_id: String,
}

impl ChapterKey {
    /// Validated key
    ///
    /// Empty ids and control characters are rejected, as is `/` in the content
    /// id since it separates the two ids in [`owner_key`](Self::owner_key).
    pub fn new(content_id: impl Into<String>, chapter_id: impl Into<String>) -> Result<Self> {
        let key = Self {
            content_id: content_id.into(),
            chapter_id: chapter_id.into(),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("content id", &self.content_id)?;
        validate_id("chapter id", &self.chapter_id)?;
        if self.content_id.contains('/') {
            return Err(PanelSyncError::invalid_input(format!(
                "content id contains '/': {:?}",
                self.content_id
            )));
        }
        Ok(())
    }

    /// Owner key used for the chapter's download cache entry
    pub fn owner_key(&self) -> String {
        format!("{}/{}", self.content_id, self.chapter_id)
    }

    /// Inverse of [`owner_key`](Self::owner_key)
    pub fn from_owner_key(owner_key: &str) -> Option<Self> {
        let (content_id, chapter_id) = owner_key.split_once('/')?;
        Self::new(content_id, chapter_id).ok()
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.content_id, self.chapter_id)
    }
}

fn validate_id(label: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(PanelSyncError::invalid_input(format!("Empty {}", label)));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(PanelSyncError::invalid_input(format!(
            "{} contains control characters: {:?}",
            label, id
        )));
    }
    Ok(())
}

/// Everything needed to resolve a chapter's page list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    #[serde(flatten)]
    pub key: ChapterKey,

    /// Opaque locator handed to the content extractor
    pub page_list_source: String,
}

impl ChapterRef {
    pub fn new(key: ChapterKey, page_list_source: impl Into<String>) -> Self {
        Self {
            key,
            page_list_source: page_list_source.into(),
        }
    }
}
