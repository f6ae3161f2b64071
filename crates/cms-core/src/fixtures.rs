//! Shared test fixtures: a small catalog space and a scripted content source.
//!
//! Catalog model:
//! - `product`: localized `name` (unique), `price`, `brand` link, `tags`
//!   link array, `image` asset link, `keywords` symbol array
//! - `brand`: localized `name`, `country`
//! - `tag`: `label`
//! - `article`: standalone, localized `title`, `body`

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{CmsError, Result};
use crate::model::{
    ContentType, Entry, Field, FieldType, Locale, Space, SyncPage,
};
use crate::traits::ContentSource;

pub const EN: &str = "en-US";
pub const DE: &str = "de-DE";
pub const FR: &str = "fr-FR";

/// Space with `en-US` default, `de-DE` and `fr-FR` (falls back to `de-DE`).
pub fn catalog_space() -> Space {
    Space::new(
        "catalog",
        vec![
            Locale::new(EN, true).with_alias("en"),
            Locale::new(DE, false),
            Locale::new(FR, false).with_fallback(DE),
        ],
    )
}

pub fn product_type() -> ContentType {
    let mut name = Field::new("name", FieldType::Symbol).localized();
    name.unique = true;
    ContentType::new(
        "product",
        vec![
            name,
            Field::new("price", FieldType::Integer),
            Field::entry_link("brand", "brand"),
            Field::entry_links("tags", "tag"),
            Field::asset_link("image"),
            Field::scalar_array("keywords", FieldType::Symbol),
        ],
    )
}

pub fn brand_type() -> ContentType {
    ContentType::new(
        "brand",
        vec![
            Field::new("name", FieldType::Symbol).localized(),
            Field::new("country", FieldType::Symbol),
        ],
    )
}

pub fn tag_type() -> ContentType {
    ContentType::new("tag", vec![Field::new("label", FieldType::Symbol)])
}

pub fn article_type() -> ContentType {
    ContentType::new(
        "article",
        vec![
            Field::new("title", FieldType::Symbol).localized(),
            Field::new("body", FieldType::Text),
        ],
    )
}

/// All catalog content types.
pub fn catalog_types() -> Vec<ContentType> {
    vec![product_type(), brand_type(), tag_type(), article_type()]
}

/// Link value pointing at an entry.
pub fn entry_link(id: &str) -> Value {
    json!({"sys": {"type": "Link", "linkType": "Entry", "id": id}})
}

/// Link value pointing at an asset.
pub fn asset_link(id: &str) -> Value {
    json!({"sys": {"type": "Link", "linkType": "Asset", "id": id}})
}

/// Product with a default-locale name and a price.
pub fn product(id: &str, name: &str, price: i64) -> Entry {
    let mut entry = Entry::new(id, "product")
        .with_field("name", EN, json!(name))
        .with_field("price", EN, json!(price));
    entry.sys.created_at = Some("2024-01-01T00:00:00Z".to_string());
    entry.sys.updated_at = Some("2024-01-02T00:00:00Z".to_string());
    entry
}

pub fn brand(id: &str, name: &str) -> Entry {
    Entry::new(id, "brand").with_field("name", EN, json!(name))
}

pub fn tag(id: &str, label: &str) -> Entry {
    Entry::new(id, "tag").with_field("label", EN, json!(label))
}

pub fn article(id: &str, title: &str) -> Entry {
    Entry::new(id, "article").with_field("title", EN, json!(title))
}

/// Scripted [`ContentSource`].
///
/// Each `sync_page` call pops the next scripted response. Once the script is
/// exhausted it answers with an empty page that echoes the request token, as
/// a source with no new changes would.
pub struct StaticSource {
    space: Space,
    content_types: Mutex<Vec<ContentType>>,
    script: Mutex<VecDeque<Result<SyncPage>>>,
    requests: Mutex<Vec<Option<String>>>,
}

impl StaticSource {
    pub fn new(space: Space, content_types: Vec<ContentType>) -> Self {
        Self {
            space,
            content_types: Mutex::new(content_types),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Catalog space and types with an empty script.
    pub fn catalog() -> Self {
        Self::new(catalog_space(), catalog_types())
    }

    /// Queue a page.
    pub fn push_page(&self, page: SyncPage) {
        self.lock_script().push_back(Ok(page));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: CmsError) {
        self.lock_script().push_back(Err(error));
    }

    /// Replace the content type definitions.
    pub fn set_content_types(&self, content_types: Vec<ContentType>) {
        if let Ok(mut guard) = self.content_types.lock() {
            *guard = content_types;
        }
    }

    /// Tokens passed to `sync_page`, in call order.
    pub fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock_script().len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<SyncPage>>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    async fn space(&self) -> Result<Space> {
        Ok(self.space.clone())
    }

    async fn content_types(&self) -> Result<Vec<ContentType>> {
        self.content_types
            .lock()
            .map(|types| types.clone())
            .map_err(|_| CmsError::internal("content type lock poisoned"))
    }

    async fn sync_page(&self, token: Option<&str>) -> Result<SyncPage> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(token.map(str::to_string));
        }
        match self.lock_script().pop_front() {
            Some(response) => response,
            None => Ok(SyncPage::done(token.unwrap_or("initial"))),
        }
    }
}
