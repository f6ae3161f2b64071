//! Names of generated database objects.

use cms_core::{columns, Ident};

/// Table holding assets.
pub const ASSETS_TABLE: &str = "_assets";

/// Prefix for fields that collide with system columns.
pub const COLLISION_PREFIX: &str = "field_";

/// Table of a content type.
pub fn table_name(content_type: &str) -> Ident {
    Ident::sanitize(content_type)
}

/// Column of a field; system column names get [`COLLISION_PREFIX`].
pub fn column_name(field_id: &str) -> Ident {
    let ident = Ident::sanitize(field_id);
    if columns::RESERVED.contains(&ident.as_str()) {
        Ident::sanitize(&format!("{}{}", COLLISION_PREFIX, ident))
    } else {
        ident
    }
}

/// ConTable of an array-link field.
pub fn con_table_name(table: &Ident, column: &Ident) -> Ident {
    Ident::sanitize(&format!("con_{}_{}", table, column))
}

/// Query function of a table.
pub fn function_name(table: &Ident) -> Ident {
    Ident::sanitize(&format!("q_{}", table))
}

/// Materialized view of a table in one locale.
pub fn view_name(table: &Ident, locale: &str) -> Ident {
    Ident::sanitize(&format!("mv_{}__{}", table, Ident::sanitize(locale)))
}

/// Index name derived from its table and columns.
pub fn index_name(table: &Ident, columns: &[&Ident], unique: bool) -> Ident {
    let cols = columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("_");
    let suffix = if unique { "key" } else { "idx" };
    Ident::sanitize(&format!("{}_{}_{}", table, cols, suffix))
}
