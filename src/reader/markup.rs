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


//! HTML markup for reader pages
//!
//! Pages render in page order as `<img>` tags tagged `data-source="local"` or
//! `"remote"`. Local pages carry their remote URL in `data-fallback` so the
//! rendering layer can switch when a local file fails to load.

use crate::reader::offline::{PageSource, ReaderPage};
use std::fmt::Write;
use std::path::Path;
use url::Url;

/// Render pages (sorted by page number) into a chapter container
pub fn render_markup(content_id: &str, chapter_id: &str, pages: &[ReaderPage]) -> String {
    let mut ordered: Vec<&ReaderPage> = pages.iter().collect();
    ordered.sort_by_key(|page| page.page_number);

    let mut html = String::new();
    let _ = writeln!(
        html,
        r#"<div class="chapter" data-content="{}" data-chapter="{}">"#,
        escape(content_id),
        escape(chapter_id)
    );

    for page in ordered {
        let _ = writeln!(html, "  {}", render_page(page));
    }

    html.push_str("</div>\n");
    html
}

fn render_page(page: &ReaderPage) -> String {
    let local_src = match (page.source, page.local_path.as_deref()) {
        (PageSource::Local, Some(path)) => Some(file_src(path)),
        _ => None,
    };

    match local_src {
        Some(src) => format!(
            r#"<img class="page" data-page="{}" data-source="local" src="{}" data-fallback="{}" alt="Page {}" loading="lazy">"#,
            page.page_number,
            escape(&src),
            escape(&page.url),
            page.page_number
        ),
        None => format!(
            r#"<img class="page" data-page="{}" data-source="remote" src="{}" alt="Page {}" loading="lazy">"#,
            page.page_number,
            escape(&page.url),
            page.page_number
        ),
    }
}

/// `file://` URL for absolute paths, the raw path otherwise
fn file_src(path: &str) -> String {
    Url::from_file_path(Path::new(path))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| path.to_string())
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
