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


//! Post-download integrity checks
//!
//! - `sniff`: magic-byte format detection and corruption sampling
//! - `validator`: per-chapter validation, cached results and repair

pub mod sniff;
pub mod validator;

pub use sniff::{CorruptionPattern, ImageFormat};
pub use validator::{
    ChapterValidationResult, DownloadValidator, PageIssue, PageReport, RecommendedAction,
    RepairReport, ValidationOptions,
};
