//! In-process store interpreting typed statements and procedure plans.
//!
//! `MemoryStore` executes the same [`Batch`]es as [`PgStore`](crate::PgStore)
//! with the same transactional contract: a batch is applied to a copy of the
//! state and published only if every statement succeeds. Query functions are
//! evaluated directly from their [`ProcedurePlan`], resolving tables in the
//! namespace the function currently lives in, so renamed namespaces keep
//! working as bound function bodies do in PostgreSQL.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use cms_core::{
    columns, Batch, CmsError, ColumnDef, Database, FieldAccess, FieldPlan, FunctionDef, Ident,
    JoinNode, LinkPlan, NodeKind, Predicate, ProcedureCall, ProcedurePlan, QueryPage, QuerySource,
    Result, SqlValue, Statement, Transaction, ViewDef, SYNC_TOKEN_TABLE,
};

type FailRule = Box<dyn Fn(&Statement) -> bool + Send + Sync>;

/// One stored row, by column name.
pub type Row = BTreeMap<String, SqlValue>;

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<ColumnDef>,
    /// Keyed by primary key text, or by insertion sequence without one.
    rows: BTreeMap<String, Row>,
    next_seq: u64,
}

impl MemTable {
    fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }

    fn key_of(&mut self, row: &Row) -> Result<String> {
        match self.primary_key() {
            Some(pk) => row
                .get(pk)
                .and_then(SqlValue::to_sql_text)
                .ok_or_else(|| CmsError::database(format!("null value in primary key column {}", pk))),
            None => {
                self.next_seq += 1;
                Ok(format!("{:020}", self.next_seq))
            }
        }
    }

    fn check_columns(&self, given: &[ColumnDef]) -> Result<()> {
        for column in given {
            if !self.columns.iter().any(|c| c.name == column.name) {
                return Err(CmsError::database(format!(
                    "column {} does not exist",
                    column.name
                )));
            }
        }
        Ok(())
    }

    fn full_row(&self, given: &[ColumnDef], values: &[SqlValue]) -> Result<Row> {
        if given.len() != values.len() {
            return Err(CmsError::database("row width does not match column list"));
        }
        let mut row: Row = self
            .columns
            .iter()
            .map(|c| (c.name.to_string(), SqlValue::Null))
            .collect();
        for (column, value) in given.iter().zip(values) {
            row.insert(column.name.to_string(), value.clone());
        }
        for column in self.columns.iter().filter(|c| c.not_null) {
            if row.get(column.name.as_str()).map(SqlValue::is_null).unwrap_or(true) {
                return Err(CmsError::database(format!(
                    "null value in column {} violates not-null constraint",
                    column.name
                )));
            }
        }
        Ok(row)
    }
}

#[derive(Debug, Clone)]
struct MemView {
    def: ViewDef,
    rows: Vec<Row>,
    refreshed: u64,
}

#[derive(Debug, Clone, Default)]
struct MemNamespace {
    tables: BTreeMap<String, MemTable>,
    indexes: BTreeMap<String, String>,
    functions: BTreeMap<String, Arc<FunctionDef>>,
    views: BTreeMap<String, MemView>,
    /// table -> ConTables cleaned on row delete
    triggers: BTreeMap<String, Vec<Ident>>,
}

impl MemNamespace {
    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| CmsError::database(format!("relation {} does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| CmsError::database(format!("relation {} does not exist", name)))
    }

    fn relation_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.views.contains_key(name)
    }
}

#[derive(Debug, Clone, Default)]
struct MemState {
    namespaces: BTreeMap<String, MemNamespace>,
    refresh_seq: u64,
}

impl MemState {
    fn namespace(&self, name: &str) -> Result<&MemNamespace> {
        self.namespaces
            .get(name)
            .ok_or_else(|| CmsError::database(format!("schema {} does not exist", name)))
    }

    fn namespace_mut(&mut self, name: &str) -> Result<&mut MemNamespace> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| CmsError::database(format!("schema {} does not exist", name)))
    }

    fn apply(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::CreateSchema(name) => {
                self.namespaces.entry(name.to_string()).or_default();
            }
            Statement::DropSchema(name) => {
                self.namespaces.remove(name.as_str());
            }
            Statement::SwapSchemas {
                live,
                shadow,
                retired,
            } => {
                self.namespaces.remove(retired.as_str());
                let promoted = self.namespaces.remove(shadow.as_str()).ok_or_else(|| {
                    CmsError::database(format!("schema {} does not exist", shadow))
                })?;
                if let Some(previous) = self.namespaces.remove(live.as_str()) {
                    self.namespaces.insert(retired.to_string(), previous);
                }
                self.namespaces.insert(live.to_string(), promoted);
                self.namespaces.remove(retired.as_str());
            }
            Statement::CreateTable(def) => {
                let ns = self.namespace_mut(def.name.schema.as_str())?;
                ns.tables
                    .entry(def.name.name.to_string())
                    .or_insert_with(|| MemTable::new(def.columns.clone()));
            }
            Statement::CreateIndex(def) => {
                let ns = self.namespace_mut(def.table.schema.as_str())?;
                let table = ns.table(def.table.name.as_str())?;
                for column in &def.columns {
                    if !table.columns.iter().any(|c| &c.name == column) {
                        return Err(CmsError::database(format!("column {} does not exist", column)));
                    }
                }
                ns.indexes
                    .insert(def.name.to_string(), def.table.name.to_string());
            }
            Statement::CreateDeleteTrigger(def) => {
                let ns = self.namespace_mut(def.table.schema.as_str())?;
                ns.table(def.table.name.as_str())?;
                ns.triggers
                    .insert(def.table.name.to_string(), def.con_tables.clone());
            }
            Statement::CreateFunction(def) => {
                let ns = self.namespace_mut(def.name.schema.as_str())?;
                check_plan_relations(ns, &def.plan)?;
                ns.functions
                    .insert(def.name.name.to_string(), Arc::new(def.clone()));
            }
            Statement::CreateMaterializedView(def) => {
                let seq = self.next_refresh();
                let ns = self.namespace_mut(def.name.schema.as_str())?;
                if ns.views.contains_key(def.name.name.as_str()) {
                    return Ok(());
                }
                let rows = view_rows(ns, def)?;
                ns.views.insert(
                    def.name.name.to_string(),
                    MemView {
                        def: def.clone(),
                        rows,
                        refreshed: seq,
                    },
                );
            }
            Statement::RefreshMaterializedView { name, .. } => {
                let seq = self.next_refresh();
                let ns = self.namespace_mut(name.schema.as_str())?;
                let def = ns
                    .views
                    .get(name.name.as_str())
                    .map(|v| v.def.clone())
                    .ok_or_else(|| CmsError::database(format!("relation {} does not exist", name)))?;
                let rows = view_rows(ns, &def)?;
                if let Some(view) = ns.views.get_mut(name.name.as_str()) {
                    view.rows = rows;
                    view.refreshed = seq;
                }
            }
            Statement::Upsert {
                table,
                columns,
                rows,
                conflict,
            } => {
                let target = self
                    .namespace_mut(table.schema.as_str())?
                    .table_mut(table.name.as_str())?;
                target.check_columns(columns)?;
                if target.primary_key() != Some(conflict.as_str()) {
                    return Err(CmsError::database(format!(
                        "no unique constraint on {}",
                        conflict
                    )));
                }
                for values in rows {
                    let row = target.full_row(columns, values)?;
                    let key = target.key_of(&row)?;
                    match target.rows.get_mut(&key) {
                        Some(existing) => {
                            for (column, value) in columns.iter().zip(values) {
                                existing.insert(column.name.to_string(), value.clone());
                            }
                        }
                        None => {
                            target.rows.insert(key, row);
                        }
                    }
                }
            }
            Statement::Insert {
                table,
                columns,
                rows,
            }
            | Statement::CopyIn {
                table,
                columns,
                rows,
            } => {
                let target = self
                    .namespace_mut(table.schema.as_str())?
                    .table_mut(table.name.as_str())?;
                target.check_columns(columns)?;
                for values in rows {
                    let row = target.full_row(columns, values)?;
                    let key = target.key_of(&row)?;
                    if target.rows.contains_key(&key) {
                        return Err(CmsError::database(format!(
                            "duplicate key value {} in {}",
                            key, table
                        )));
                    }
                    target.rows.insert(key, row);
                }
            }
            Statement::Delete { table, predicate } => {
                let ns = self.namespace_mut(table.schema.as_str())?;
                let target = ns.table_mut(table.name.as_str())?;
                let doomed: Vec<String> = target
                    .rows
                    .iter()
                    .filter(|(_, row)| eval_predicate(predicate, row))
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut deleted_ids = Vec::with_capacity(doomed.len());
                for key in doomed {
                    if let Some(row) = target.rows.remove(&key) {
                        if let Some(id) = row.get(columns::ID).and_then(SqlValue::to_sql_text) {
                            deleted_ids.push(id);
                        }
                    }
                }

                let cons = ns.triggers.get(table.name.as_str()).cloned().unwrap_or_default();
                for con in cons {
                    let con_table = ns.table_mut(con.as_str())?;
                    con_table.rows.retain(|_, row| {
                        row.get(columns::OWNER_ID)
                            .and_then(SqlValue::to_sql_text)
                            .map(|owner| !deleted_ids.contains(&owner))
                            .unwrap_or(true)
                    });
                }
            }
            Statement::SaveSyncToken { schema, token } => {
                let target = self
                    .namespace_mut(schema.as_str())?
                    .table_mut(SYNC_TOKEN_TABLE)?;
                let mut row = Row::new();
                row.insert(columns::ID.to_string(), SqlValue::Int(0));
                row.insert("token".to_string(), SqlValue::text(token.clone()));
                row.insert(columns::UPDATED_AT.to_string(), SqlValue::Null);
                target.rows.insert("0".to_string(), row);
            }
        }
        Ok(())
    }

    fn next_refresh(&mut self) -> u64 {
        self.refresh_seq += 1;
        self.refresh_seq
    }
}

fn check_plan_relations(ns: &MemNamespace, plan: &ProcedurePlan) -> Result<()> {
    ns.table(plan.locales_table.name.as_str())?;
    check_node_relations(ns, &plan.root)
}

fn check_node_relations(ns: &MemNamespace, node: &JoinNode) -> Result<()> {
    ns.table(node.table.name.as_str())?;
    for field in &node.fields {
        if let FieldAccess::Links { con_table, .. } = &field.access {
            ns.table(con_table.name.as_str())?;
        }
    }
    for child in node.children() {
        check_node_relations(ns, child)?;
    }
    Ok(())
}

fn view_rows(ns: &MemNamespace, def: &ViewDef) -> Result<Vec<Row>> {
    let function = ns.functions.get(def.function.name.as_str()).ok_or_else(|| {
        CmsError::database(format!("function {} does not exist", def.function))
    })?;
    evaluate_plan(ns, &function.plan, &def.locale)
}

/// Requested, fallback and default locale codes of one invocation.
struct LocaleContext {
    req: String,
    fb: String,
    def: String,
}

fn text_of<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(SqlValue::as_str)
}

fn locale_context(ns: &MemNamespace, plan: &ProcedurePlan, locale: &str) -> Result<Option<LocaleContext>> {
    let locales = ns.table(plan.locales_table.name.as_str())?;
    let default = locales
        .rows
        .values()
        .find(|r| matches!(r.get("is_default"), Some(SqlValue::Bool(true))))
        .and_then(|r| text_of(r, "code"));
    let requested = locales
        .rows
        .values()
        .find(|r| text_of(r, "code") == Some(locale));

    Ok(match (requested, default) {
        (Some(row), Some(default)) => Some(LocaleContext {
            req: locale.to_string(),
            fb: text_of(row, "fallback_code").unwrap_or(default).to_string(),
            def: default.to_string(),
        }),
        _ => None,
    })
}

/// Evaluate a query function the way its rendered SQL body does.
fn evaluate_plan(ns: &MemNamespace, plan: &ProcedurePlan, locale: &str) -> Result<Vec<Row>> {
    let Some(lc) = locale_context(ns, plan, locale)? else {
        return Ok(Vec::new());
    };
    let evaluator = PlanEvaluator { ns, lc: &lc };
    let root = &plan.root;
    let table = ns.table(root.table.name.as_str())?;

    let mut out = Vec::new();
    for base in table
        .rows
        .values()
        .filter(|r| text_of(r, columns::LOCALE) == Some(lc.def.as_str()))
    {
        let mut row = Row::new();
        for column in [columns::SYS_ID, columns::VERSION, columns::CREATED_AT, columns::UPDATED_AT] {
            row.insert(column.to_string(), base.get(column).cloned().unwrap_or(SqlValue::Null));
        }
        row.insert(columns::LOCALE.to_string(), SqlValue::text(lc.req.clone()));
        for field in &root.fields {
            if matches!(field.access, FieldAccess::Value(_) | FieldAccess::Link(_)) {
                row.insert(field.column.to_string(), evaluator.value(root, base, field)?);
            }
        }
        row.insert(
            columns::DATA.to_string(),
            SqlValue::Json(evaluator.node_json(root, base)?),
        );
        out.push(row);
    }
    Ok(out)
}

struct PlanEvaluator<'a> {
    ns: &'a MemNamespace,
    lc: &'a LocaleContext,
}

impl<'a> PlanEvaluator<'a> {
    fn find_row(&self, table: &str, sys_id: &str, locale: &str) -> Result<Option<&'a Row>> {
        Ok(self.ns.table(table)?.rows.values().find(|r| {
            text_of(r, columns::SYS_ID) == Some(sys_id) && text_of(r, columns::LOCALE) == Some(locale)
        }))
    }

    fn value(&self, node: &JoinNode, base: &Row, field: &FieldPlan) -> Result<SqlValue> {
        let column = field.column.as_str();
        let own = base.get(column).cloned().unwrap_or(SqlValue::Null);
        if !(node.has_localized && field.localized) {
            return Ok(own);
        }
        let Some(sys_id) = text_of(base, columns::SYS_ID) else {
            return Ok(own);
        };
        for locale in [&self.lc.req, &self.lc.fb] {
            if let Some(row) = self.find_row(node.table.name.as_str(), sys_id, locale)? {
                if let Some(value) = row.get(column).filter(|v| !v.is_null()) {
                    return Ok(value.clone());
                }
            }
        }
        Ok(own)
    }

    fn node_json(&self, node: &JoinNode, base: &Row) -> Result<Value> {
        let get = |column: &str| base.get(column).map(SqlValue::to_json).unwrap_or(Value::Null);

        let mut sys = Map::new();
        sys.insert("id".to_string(), get(columns::SYS_ID));
        sys.insert(
            "type".to_string(),
            json!(match node.kind {
                NodeKind::Entry => "Entry",
                NodeKind::Asset => "Asset",
            }),
        );
        if node.kind == NodeKind::Entry {
            sys.insert(
                "contentType".to_string(),
                json!({"sys": {"id": node.content_type}}),
            );
        }
        sys.insert("createdAt".to_string(), get(columns::CREATED_AT));
        sys.insert("updatedAt".to_string(), get(columns::UPDATED_AT));
        sys.insert("version".to_string(), get(columns::VERSION));
        sys.insert("locale".to_string(), json!(self.lc.req));

        let mut fields = Map::new();
        for field in &node.fields {
            let value = match &field.access {
                FieldAccess::Value(_) => self.value(node, base, field)?.to_json(),
                FieldAccess::Link(link) => match self.value(node, base, field)? {
                    SqlValue::Null => Value::Null,
                    id => {
                        let id = id.to_sql_text().unwrap_or_default();
                        match link {
                            LinkPlan::Stub => json!({"sys": {"id": id}}),
                            LinkPlan::Expand(child) => {
                                match self.find_row(child.table.name.as_str(), &id, &self.lc.def)? {
                                    Some(row) => self.node_json(child, row)?,
                                    None => Value::Null,
                                }
                            }
                        }
                    }
                },
                FieldAccess::Links { con_table, target } => {
                    self.links_json(base, field, con_table.name.as_str(), target)?
                }
            };
            fields.insert(field.field_id.clone(), value);
        }

        Ok(json!({"sys": Value::Object(sys), "fields": Value::Object(fields)}))
    }

    fn links_json(&self, base: &Row, field: &FieldPlan, con_table: &str, target: &LinkPlan) -> Result<Value> {
        let con = self.ns.table(con_table)?;
        let Some(owner) = text_of(base, columns::SYS_ID) else {
            return Ok(json!([]));
        };
        let edges: Vec<&Row> = con
            .rows
            .values()
            .filter(|r| text_of(r, columns::OWNER_SYS_ID) == Some(owner))
            .collect();

        let locale = if field.localized {
            [&self.lc.req, &self.lc.fb, &self.lc.def]
                .into_iter()
                .find(|l| edges.iter().any(|e| text_of(e, columns::LOCALE) == Some(l.as_str())))
                .cloned()
        } else {
            Some(self.lc.def.clone())
        };
        let Some(locale) = locale else {
            return Ok(json!([]));
        };

        let mut chosen: Vec<&Row> = edges
            .into_iter()
            .filter(|e| text_of(e, columns::LOCALE) == Some(locale.as_str()))
            .collect();
        chosen.sort_by(|a, b| {
            let pa = a.get(columns::POSITION).cloned().unwrap_or(SqlValue::Null);
            let pb = b.get(columns::POSITION).cloned().unwrap_or(SqlValue::Null);
            pa.compare(&pb).unwrap_or(Ordering::Equal)
        });

        let mut items = Vec::with_capacity(chosen.len());
        for edge in chosen {
            let Some(target_id) = text_of(edge, columns::TARGET_SYS_ID) else {
                continue;
            };
            match target {
                LinkPlan::Stub => items.push(json!({"sys": {"id": target_id}})),
                LinkPlan::Expand(child) => {
                    if let Some(row) = self.find_row(child.table.name.as_str(), target_id, &self.lc.def)? {
                        items.push(self.node_json(child, row)?);
                    }
                }
            }
        }
        Ok(Value::Array(items))
    }
}

/// Evaluate a predicate against one row; NULL never satisfies a comparison.
pub fn eval_predicate(predicate: &Predicate, row: &Row) -> bool {
    let get = |name: &Ident| row.get(name.as_str()).cloned().unwrap_or(SqlValue::Null);

    match predicate {
        Predicate::Compare { column, op, value } => {
            let actual = get(&column.name);
            match op {
                cms_core::CompareOp::Eq => actual.sql_eq(value),
                cms_core::CompareOp::Ne => match (&actual, value) {
                    (SqlValue::Null, SqlValue::Null) => false,
                    (SqlValue::Null, _) | (_, SqlValue::Null) => true,
                    _ => !actual.sql_eq(value),
                },
                other => actual
                    .compare(value)
                    .map(|ordering| other.holds(ordering))
                    .unwrap_or(false),
            }
        }
        Predicate::IsNull(column) => get(&column.name).is_null(),
        Predicate::IsNotNull(column) => !get(&column.name).is_null(),
        Predicate::Matches { column, pattern } => {
            let text = match get(&column.name) {
                SqlValue::Null => return false,
                SqlValue::Array(items) => items
                    .iter()
                    .filter_map(SqlValue::to_sql_text)
                    .collect::<Vec<_>>()
                    .join(" "),
                other => other.to_sql_text().unwrap_or_default(),
            };
            ilike(&text, pattern)
        }
        Predicate::ContainsAll { column, values } => match get(&column.name) {
            SqlValue::Array(items) => values.iter().all(|v| items.iter().any(|i| i.sql_eq(v))),
            _ => false,
        },
        Predicate::AnyOf { column, values } => any_of(&get(&column.name), values),
        Predicate::NoneOf { column, values } => match get(&column.name) {
            SqlValue::Null => true,
            actual => !any_of(&actual, values),
        },
        Predicate::And(parts) => parts.iter().all(|p| eval_predicate(p, row)),
    }
}

fn any_of(actual: &SqlValue, values: &[SqlValue]) -> bool {
    match actual {
        SqlValue::Null => false,
        SqlValue::Array(items) => items.iter().any(|i| values.iter().any(|v| i.sql_eq(v))),
        scalar => values.iter().any(|v| scalar.sql_eq(v)),
    }
}

/// Case-insensitive LIKE: `%` any run, `_` one character, `\` escapes.
pub fn ilike(text: &str, pattern: &str) -> bool {
    enum Token {
        Any,
        One,
        Lit(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars().flat_map(char::to_lowercase);
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Lit(chars.next().unwrap_or('\\')),
            other => Token::Lit(other),
        });
    }
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

    // matched[j]: tokens[..i] match text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for token in &tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            Token::Any => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= matched[j];
                    next[j] = reachable;
                }
            }
            Token::One => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1];
                }
            }
            Token::Lit(c) => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && text[j - 1] == *c;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}

fn compare_nulls_last(a: &SqlValue, b: &SqlValue, descending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = a.compare(b).unwrap_or(Ordering::Equal);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

/// In-memory [`Database`] for tests and embedding.
pub struct MemoryStore {
    state: Mutex<MemState>,
    fail_rules: Mutex<Vec<FailRule>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    committed: AtomicUsize,
    applied: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            fail_rules: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every batch containing a statement matching `rule`.
    pub fn fail_when(&self, rule: impl Fn(&Statement) -> bool + Send + Sync + 'static) {
        if let Ok(mut rules) = self.fail_rules.lock() {
            rules.push(Box::new(rule));
        }
    }

    /// Remove all failure rules.
    pub fn clear_failures(&self) {
        if let Ok(mut rules) = self.fail_rules.lock() {
            rules.clear();
        }
    }

    /// Delay every `execute` by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Highest number of concurrently running `execute` calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(AtomicOrdering::SeqCst)
    }

    /// Number of committed batches.
    pub fn committed_batches(&self) -> usize {
        self.committed.load(AtomicOrdering::SeqCst)
    }

    /// Number of batches applied, inside transactions or not.
    pub fn applied_batches(&self) -> usize {
        self.applied.load(AtomicOrdering::SeqCst)
    }

    /// Names of existing namespaces.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    /// Rows of a table ordered by primary key.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.lock()
            .namespaces
            .get(schema)
            .and_then(|ns| ns.tables.get(table))
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, schema: &str, table: &str) -> usize {
        self.lock()
            .namespaces
            .get(schema)
            .and_then(|ns| ns.tables.get(table))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Blake3 digest of a table's rows, `None` if the table does not exist.
    pub fn table_digest(&self, schema: &str, table: &str) -> Option<String> {
        let state = self.lock();
        let rows = &state.namespaces.get(schema)?.tables.get(table)?.rows;
        let bytes = serde_json::to_vec(rows).ok()?;
        Some(hex::encode(blake3::hash(&bytes).as_bytes()))
    }

    /// Row count of every table in a namespace.
    pub fn table_counts(&self, schema: &str) -> BTreeMap<String, usize> {
        self.lock()
            .namespaces
            .get(schema)
            .map(|ns| {
                ns.tables
                    .iter()
                    .map(|(name, t)| (name.clone(), t.rows.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rendered bodies of every function in a namespace.
    pub fn function_bodies(&self, schema: &str) -> BTreeMap<String, String> {
        self.lock()
            .namespaces
            .get(schema)
            .map(|ns| {
                ns.functions
                    .iter()
                    .map(|(name, f)| (name.clone(), f.body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of materialized views in a namespace.
    pub fn views(&self, schema: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(schema)
            .map(|ns| ns.views.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Monotonic stamp of a view's last refresh.
    pub fn view_refreshed(&self, schema: &str, view: &str) -> Option<u64> {
        self.lock()
            .namespaces
            .get(schema)?
            .views
            .get(view)
            .map(|v| v.refreshed)
    }

    /// Whether a namespace has a table or view of this name.
    pub fn relation_exists(&self, schema: &str, name: &str) -> bool {
        self.lock()
            .namespaces
            .get(schema)
            .map(|ns| ns.relation_exists(name))
            .unwrap_or(false)
    }

    fn check_failures(&self, batch: &Batch) -> Result<()> {
        let rules = self
            .fail_rules
            .lock()
            .map_err(|_| CmsError::internal("failure rules poisoned"))?;
        for statement in batch.iter() {
            if rules.iter().any(|rule| rule(statement)) {
                return Err(CmsError::database(format!(
                    "injected failure on {} in {}",
                    statement.kind(),
                    statement.schema()
                )));
            }
        }
        Ok(())
    }

    fn call_rows(state: &MemState, call: &ProcedureCall) -> Result<Vec<Row>> {
        match &call.source {
            QuerySource::Function(name) => {
                let ns = state.namespace(name.schema.as_str())?;
                let function = ns.functions.get(name.name.as_str()).ok_or_else(|| {
                    CmsError::database(format!("function {} does not exist", name))
                })?;
                evaluate_plan(ns, &function.plan, &call.locale)
            }
            QuerySource::View(name) => {
                let ns = state.namespace(name.schema.as_str())?;
                ns.views
                    .get(name.name.as_str())
                    .map(|v| v.rows.clone())
                    .ok_or_else(|| CmsError::database(format!("relation {} does not exist", name)))
            }
        }
    }
}

/// Namespaces a statement writes to.
fn written_namespaces(statement: &Statement) -> Vec<String> {
    match statement {
        Statement::SwapSchemas {
            live,
            shadow,
            retired,
        } => vec![live.to_string(), shadow.to_string(), retired.to_string()],
        other => vec![other.schema().to_string()],
    }
}

/// Transaction over a private copy of the state. Commit publishes the
/// namespaces it wrote.
struct MemTransaction<'a> {
    store: &'a MemoryStore,
    state: MemState,
    written: BTreeSet<String>,
    aborted: bool,
}

#[async_trait]
impl Transaction for MemTransaction<'_> {
    async fn execute(&mut self, batch: Batch) -> Result<()> {
        if self.aborted {
            return Err(CmsError::database(
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        let result = self.store.check_failures(&batch).and_then(|()| {
            for statement in batch.iter() {
                self.written.extend(written_namespaces(statement));
                self.state.apply(statement)?;
            }
            Ok(())
        });
        match &result {
            Ok(()) => {
                self.store.applied.fetch_add(1, AtomicOrdering::SeqCst);
            }
            Err(_) => self.aborted = true,
        }
        result
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.aborted {
            return Err(CmsError::database("transaction was aborted"));
        }
        let MemTransaction {
            store,
            state: mut working,
            written,
            ..
        } = *self;
        let mut state = store.lock();
        for name in &written {
            match working.namespaces.remove(name) {
                Some(ns) => {
                    state.namespaces.insert(name.clone(), ns);
                }
                None => {
                    state.namespaces.remove(name);
                }
            }
        }
        state.refresh_seq = state.refresh_seq.max(working.refresh_seq);
        store.committed.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(namespaces = written.len(), "Memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn execute(&self, batch: Batch) -> Result<()> {
        let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, AtomicOrdering::SeqCst);

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.check_failures(&batch)?;

        let mut state = self.lock();
        let mut next = state.clone();
        for statement in batch.iter() {
            next.apply(statement)?;
        }
        *state = next;
        self.committed.fetch_add(1, AtomicOrdering::SeqCst);
        self.applied.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(statements = batch.len(), "Memory batch committed");
        Ok(())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn Transaction + 'a>> {
        let state = self.lock().clone();
        Ok(Box::new(MemTransaction {
            store: self,
            state,
            written: BTreeSet::new(),
            aborted: false,
        }))
    }

    async fn call(&self, call: &ProcedureCall) -> Result<QueryPage> {
        let rows = {
            let state = self.lock();
            Self::call_rows(&state, call)?
        };

        let filter = Predicate::And(call.filters.clone());
        let mut matched: Vec<Row> = rows
            .into_iter()
            .filter(|row| eval_predicate(&filter, row))
            .collect();

        let order = call.effective_order();
        matched.sort_by(|a, b| {
            for term in &order {
                let left = a.get(term.column.as_str()).cloned().unwrap_or(SqlValue::Null);
                let right = b.get(term.column.as_str()).cloned().unwrap_or(SqlValue::Null);
                let ordering = compare_nulls_last(&left, &right, term.descending);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        let count = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(call.skip as usize)
            .take(call.take as usize)
            .map(|row| {
                row.get(columns::DATA)
                    .map(SqlValue::to_json)
                    .unwrap_or(Value::Null)
            })
            .collect();

        Ok(QueryPage {
            count,
            items: Value::Array(items),
        })
    }

    async fn load_sync_token(&self, schema: &Ident) -> Result<Option<String>> {
        let state = self.lock();
        Ok(state
            .namespaces
            .get(schema.as_str())
            .and_then(|ns| ns.tables.get(SYNC_TOKEN_TABLE))
            .and_then(|t| t.rows.get("0"))
            .and_then(|row| text_of(row, "token"))
            .map(str::to_string))
    }

    async fn schema_exists(&self, schema: &Ident) -> Result<bool> {
        Ok(self.lock().namespaces.contains_key(schema.as_str()))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::fixtures::{catalog_space, catalog_types, EN};
    use cms_core::{
        col, row_id, ColumnRef, CompareOp, OrderTerm, QualifiedName, SqlType, TableDef,
    };
    use cms_schema::{ProcedureGenerator, SchemaCompiler};

    fn ns() -> Ident {
        Ident::new("content").unwrap()
    }

    fn qn(name: &str) -> QualifiedName {
        QualifiedName::new(&ns(), &Ident::sanitize(name))
    }

    fn tag_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new(col(columns::ID), SqlType::Text).primary_key(),
            ColumnDef::new(col(columns::SYS_ID), SqlType::Text).not_null(),
            ColumnDef::new(col(columns::LOCALE), SqlType::Text).not_null(),
            ColumnDef::new(Ident::new("label").unwrap(), SqlType::Text),
        ]
    }

    fn tag_row(id: &str, label: &str) -> Vec<SqlValue> {
        vec![
            SqlValue::text(row_id(id, EN)),
            SqlValue::text(id),
            SqlValue::text(EN),
            SqlValue::text(label),
        ]
    }

    async fn store_with_catalog() -> MemoryStore {
        let store = MemoryStore::new();
        let schema = SchemaCompiler::new(&catalog_space())
            .unwrap()
            .compile(&catalog_types());
        let mut batch = Batch::from(schema.ddl(&ns(), &catalog_space()).unwrap());
        batch.extend(ProcedureGenerator::default().statements(&schema, &ns()).unwrap());
        store.execute(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let store = MemoryStore::new();
        store
            .execute(Batch::from(vec![
                Statement::CreateSchema(ns()),
                Statement::CreateTable(TableDef {
                    name: qn("tag"),
                    columns: tag_columns(),
                }),
            ]))
            .await
            .unwrap();

        let result = store
            .execute(Batch::from(vec![
                Statement::Insert {
                    table: qn("tag"),
                    columns: tag_columns(),
                    rows: vec![tag_row("t1", "a")],
                },
                Statement::Insert {
                    table: qn("tag"),
                    columns: tag_columns(),
                    rows: vec![tag_row("t1", "dup")],
                },
            ]))
            .await;
        assert!(result.is_err());
        assert_eq!(store.row_count("content", "tag"), 0);
    }

    async fn tag_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .execute(Batch::from(vec![
                Statement::CreateSchema(ns()),
                Statement::CreateTable(TableDef {
                    name: qn("tag"),
                    columns: tag_columns(),
                }),
            ]))
            .await
            .unwrap();
        store
    }

    fn copy_tags(rows: Vec<Vec<SqlValue>>) -> Batch {
        Batch::from(Statement::CopyIn {
            table: qn("tag"),
            columns: tag_columns(),
            rows,
        })
    }

    #[tokio::test]
    async fn test_transaction_publishes_on_commit() {
        let store = tag_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.execute(copy_tags(vec![tag_row("t1", "a")])).await.unwrap();
        tx.execute(copy_tags(vec![tag_row("t2", "b")])).await.unwrap();
        assert_eq!(store.row_count("content", "tag"), 0);

        // writes to other namespaces during the transaction survive commit
        store
            .execute(Batch::from(Statement::CreateSchema(Ident::new("other").unwrap())))
            .await
            .unwrap();

        let committed = store.committed_batches();
        tx.commit().await.unwrap();
        assert_eq!(store.committed_batches(), committed + 1);
        assert_eq!(store.applied_batches(), 4);
        assert_eq!(store.row_count("content", "tag"), 2);
        assert_eq!(store.namespaces(), vec!["content", "other"]);
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let store = tag_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.execute(copy_tags(vec![tag_row("t1", "a")])).await.unwrap();
        assert!(tx.execute(copy_tags(vec![tag_row("t1", "dup")])).await.is_err());
        assert!(tx.execute(copy_tags(vec![tag_row("t2", "b")])).await.is_err());
        assert!(tx.commit().await.is_err());
        assert_eq!(store.row_count("content", "tag"), 0);

        let mut tx = store.begin().await.unwrap();
        tx.execute(copy_tags(vec![tag_row("t1", "a")])).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.row_count("content", "tag"), 0);

        store.fail_when(|s| matches!(s, Statement::SaveSyncToken { .. }));
        let mut tx = store.begin().await.unwrap();
        let result = tx
            .execute(Batch::from(Statement::SaveSyncToken {
                schema: ns(),
                token: "t1".to_string(),
            }))
            .await;
        assert!(matches!(result, Err(CmsError::Database { .. })));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        store
            .execute(Batch::from(vec![
                Statement::CreateSchema(ns()),
                Statement::CreateTable(TableDef {
                    name: qn("tag"),
                    columns: tag_columns(),
                }),
            ]))
            .await
            .unwrap();

        let upsert = Statement::Upsert {
            table: qn("tag"),
            columns: tag_columns(),
            rows: vec![tag_row("t1", "a"), tag_row("t2", "b")],
            conflict: col(columns::ID),
        };
        store.execute(Batch::from(upsert.clone())).await.unwrap();
        let digest = store.table_digest("content", "tag").unwrap();
        store.execute(Batch::from(upsert)).await.unwrap();
        assert_eq!(store.table_digest("content", "tag").unwrap(), digest);
        assert_eq!(store.row_count("content", "tag"), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_rolls_back() {
        let store = MemoryStore::new();
        store.fail_when(|s| matches!(s, Statement::CreateTable(_)));
        let result = store
            .execute(Batch::from(vec![
                Statement::CreateSchema(ns()),
                Statement::CreateTable(TableDef {
                    name: qn("tag"),
                    columns: tag_columns(),
                }),
            ]))
            .await;
        assert!(matches!(result, Err(CmsError::Database { .. })));
        assert!(!store.schema_exists(&ns()).await.unwrap());

        store.clear_failures();
        store
            .execute(Batch::from(Statement::CreateSchema(ns())))
            .await
            .unwrap();
        assert!(store.schema_exists(&ns()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_token_roundtrip() {
        let store = store_with_catalog().await;
        assert_eq!(store.load_sync_token(&ns()).await.unwrap(), None);
        store
            .execute(Batch::from(Statement::SaveSyncToken {
                schema: ns(),
                token: "abc".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(
            store.load_sync_token(&ns()).await.unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(
            store.load_sync_token(&Ident::new("missing").unwrap()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_trigger_cascades_con_rows() {
        let store = store_with_catalog().await;
        let con_columns = cms_schema::ConTable::columns();
        let product = qn("product");
        store
            .execute(Batch::from(vec![
                Statement::Insert {
                    table: product.clone(),
                    columns: vec![
                        ColumnDef::new(col(columns::ID), SqlType::Text).primary_key(),
                        ColumnDef::new(col(columns::SYS_ID), SqlType::Text),
                        ColumnDef::new(col(columns::LOCALE), SqlType::Text),
                    ],
                    rows: vec![vec![
                        SqlValue::text(row_id("p1", EN)),
                        SqlValue::text("p1"),
                        SqlValue::text(EN),
                    ]],
                },
                Statement::Insert {
                    table: qn("con_product_tags"),
                    columns: con_columns,
                    rows: vec![vec![
                        SqlValue::text("p1_en-US_0"),
                        SqlValue::text(row_id("p1", EN)),
                        SqlValue::text("p1"),
                        SqlValue::text(row_id("t1", EN)),
                        SqlValue::text("t1"),
                        SqlValue::text(EN),
                        SqlValue::Int(0),
                    ]],
                },
            ]))
            .await
            .unwrap();
        assert_eq!(store.row_count("content", "con_product_tags"), 1);

        store
            .execute(Batch::from(Statement::Delete {
                table: product,
                predicate: Predicate::text_eq(columns::SYS_ID, "p1"),
            }))
            .await
            .unwrap();
        assert_eq!(store.row_count("content", "product"), 0);
        assert_eq!(store.row_count("content", "con_product_tags"), 0);
    }

    #[tokio::test]
    async fn test_swap_renames_namespaces() {
        let store = MemoryStore::new();
        let live = ns();
        let shadow = Ident::new("content_shadow").unwrap();
        let retired = Ident::new("content_retired").unwrap();
        let swap = Statement::SwapSchemas {
            live: live.clone(),
            shadow: shadow.clone(),
            retired,
        };

        assert!(store.execute(Batch::from(swap.clone())).await.is_err());

        store
            .execute(Batch::from(vec![
                Statement::CreateSchema(shadow.clone()),
                Statement::CreateTable(TableDef {
                    name: QualifiedName::new(&shadow, &Ident::new("tag").unwrap()),
                    columns: tag_columns(),
                }),
            ]))
            .await
            .unwrap();
        store.execute(Batch::from(swap)).await.unwrap();
        assert_eq!(store.namespaces(), vec!["content".to_string()]);
        assert!(store.relation_exists("content", "tag"));
    }

    #[tokio::test]
    async fn test_call_filters_orders_and_pages() {
        let store = store_with_catalog().await;
        let columns = vec![
            ColumnDef::new(col(columns::ID), SqlType::Text).primary_key(),
            ColumnDef::new(col(columns::SYS_ID), SqlType::Text),
            ColumnDef::new(col(columns::LOCALE), SqlType::Text),
            ColumnDef::new(Ident::new("name").unwrap(), SqlType::Text),
            ColumnDef::new(Ident::new("price").unwrap(), SqlType::Integer),
        ];
        let rows = [("p1", "Foo", 10), ("p2", "Bar", 20), ("p3", "Zoo", 30)]
            .iter()
            .map(|(id, name, price)| {
                vec![
                    SqlValue::text(row_id(id, EN)),
                    SqlValue::text(*id),
                    SqlValue::text(EN),
                    SqlValue::text(*name),
                    SqlValue::Int(*price),
                ]
            })
            .collect();
        store
            .execute(Batch::from(Statement::Insert {
                table: qn("product"),
                columns,
                rows,
            }))
            .await
            .unwrap();

        let price = ColumnRef::new(Ident::new("price").unwrap(), SqlType::Integer);
        let call = ProcedureCall {
            source: QuerySource::Function(qn("q_product")),
            locale: EN.to_string(),
            filters: vec![Predicate::Compare {
                column: price.clone(),
                op: CompareOp::Gt,
                value: SqlValue::Int(15),
            }],
            order: vec![OrderTerm {
                column: price.name.clone(),
                descending: true,
            }],
            skip: 0,
            take: 10,
        };
        let page = store.call(&call).await.unwrap();
        assert_eq!(page.count, 2);
        let names: Vec<&str> = page
            .item_list()
            .iter()
            .map(|i| i["fields"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Zoo", "Bar"]);
        assert_eq!(page.item_list()[0]["sys"]["contentType"]["sys"]["id"], "product");
        assert_eq!(page.item_list()[0]["fields"]["tags"], json!([]));
        assert_eq!(page.item_list()[0]["fields"]["brand"], Value::Null);

        let paged = store
            .call(&ProcedureCall {
                skip: 1,
                take: 1,
                filters: Vec::new(),
                ..call.clone()
            })
            .await
            .unwrap();
        assert_eq!(paged.count, 3);
        assert_eq!(paged.item_list().len(), 1);
        assert_eq!(paged.item_list()[0]["fields"]["price"], 20);

        let unknown_locale = store
            .call(&ProcedureCall {
                locale: "xx-XX".to_string(),
                ..call
            })
            .await
            .unwrap();
        assert_eq!(unknown_locale.count, 0);
    }

    #[test]
    fn test_ilike() {
        assert!(ilike("Foo", "%oo%"));
        assert!(ilike("ZOO", "%oo%"));
        assert!(!ilike("Bar", "%oo%"));
        assert!(ilike("a_b", "a\\_b"));
        assert!(!ilike("axb", "a\\_b"));
        assert!(ilike("axb", "a_b"));
        assert!(ilike("", "%"));
    }

    #[test]
    fn test_predicates_on_nulls() {
        let mut row = Row::new();
        row.insert("price".to_string(), SqlValue::Null);
        let price = ColumnRef::new(Ident::new("price").unwrap(), SqlType::Integer);

        let gt = Predicate::Compare {
            column: price.clone(),
            op: CompareOp::Gt,
            value: SqlValue::Int(1),
        };
        let ne = Predicate::Compare {
            column: price.clone(),
            op: CompareOp::Ne,
            value: SqlValue::Int(1),
        };
        let nin = Predicate::NoneOf {
            column: price.clone(),
            values: vec![SqlValue::Int(1)],
        };
        let any = Predicate::AnyOf {
            column: price,
            values: vec![SqlValue::Int(1)],
        };
        assert!(!eval_predicate(&gt, &row));
        assert!(eval_predicate(&ne, &row));
        assert!(eval_predicate(&nin, &row));
        assert!(!eval_predicate(&any, &row));
    }

    #[tokio::test]
    async fn test_concurrency_is_tracked() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Some(Duration::from_millis(20)));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.execute(Batch::from(Statement::CreateSchema(ns()))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(store.max_in_flight() >= 2);
        assert_eq!(store.committed_batches(), 3);
    }
}
