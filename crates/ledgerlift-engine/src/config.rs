//! Migration configuration
//!
//! A run is fully described by one [`MigrationConfig`] value: tenant, batch
//! and retry bounds, matching strategies, enum mapping tables and the
//! per-table mapping from source documents to target rows. Nothing in the
//! engine reads the environment; callers build or deserialize this object and
//! pass it in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::graph::DependencyGraph;

// ============================================================================
// Defaults
// ============================================================================

/// Default number of entities per bulk insert
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of source records requested per page
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default attempts for a single batch write or page fetch
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts in milliseconds
pub const DEFAULT_BACKOFF_MS: u64 = 1_000;

/// Skip rate above which a table is flagged in the run report
pub const DEFAULT_SKIP_RATE_THRESHOLD: f64 = 0.10;

/// Column compared by time-window rollback selections; set by the target on
/// insert and never mapped from source data
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "migrated_at";

/// Top-level configuration for one migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Target company/tenant identifier written into tenant columns and used
    /// to scope every lookup and cleanup selection
    pub tenant_id: String,
    pub batch_size: usize,
    pub page_size: usize,
    pub retry: RetryPolicy,
    /// Matching strategies in the order they are tried
    pub strategies: Vec<MatchStrategy>,
    pub ambiguity: AmbiguityPolicy,
    pub skip_rate_threshold: f64,
    /// Where partially extracted resources are written when extraction stops
    /// early; `None` disables checkpointing
    pub checkpoint_dir: Option<PathBuf>,
    pub rollback_timestamp_column: String,
    /// Enum mapping tables by name
    pub enums: BTreeMap<String, EnumTable>,
    pub tables: Vec<TableSpec>,
}

/// Retry bound and backoff for batch writes and page fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff: BackoffKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `backoff_ms * 2^(attempt - 1)`
    Exponential,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms;
        let millis = match self.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            },
        };
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            backoff: BackoffKind::Fixed,
        }
    }
}

/// Identity matching strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Source id found in the identity link index
    Direct,
    /// Normalized alternate key found in the secondary index
    Secondary,
}

/// What to do when a secondary key matches more than one target row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Take the first row in index build order
    #[default]
    FirstWins,
    /// Treat the reference as unresolved
    Reject,
}

/// Case-insensitive lookup table for one enum field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumTable {
    /// Source value -> canonical value
    pub mappings: BTreeMap<String, String>,
    /// Used for missing and unrecognized input
    pub default: String,
}

impl EnumTable {
    pub fn new(default: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        Self {
            mappings: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default: default.into(),
        }
    }

    /// Map a raw value; comparison ignores case and surrounding whitespace
    pub fn map(&self, raw: Option<&str>) -> &str {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return &self.default;
        };
        self.mappings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(raw))
            .map(|(_, v)| v.as_str())
            .unwrap_or(&self.default)
    }
}

/// Mapping of one target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Where the records come from; `None` means the table only takes part
    /// in the dependency graph (matching and cleanup), it is never migrated
    #[serde(default)]
    pub source: Option<SourceBinding>,
    /// Alternative source fields holding the record's identity
    #[serde(default = "default_source_id_fields")]
    pub source_id_fields: Vec<String>,
    /// Target column storing the source identity, used to prime the direct
    /// index and to recognise rows inserted by an earlier run
    pub source_key_column: String,
    /// Column receiving the tenant id
    #[serde(default)]
    pub tenant_column: Option<String>,
    #[serde(default)]
    pub secondary_key: Option<SecondaryKeySpec>,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyRule>,
}

fn default_source_id_fields() -> Vec<String> {
    vec!["id".to_string()]
}

/// Where a table's records are read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    /// Resource type passed to the source collaborator
    pub resource: String,
    /// When set, records are the `child_type` collection nested under each
    /// record of `resource`
    #[serde(default)]
    pub nested_under: Option<String>,
}

/// Alternate key used by the secondary matching strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryKeySpec {
    /// Target column the secondary index is built from
    pub column: String,
}

/// One target column and how to derive it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub column: String,
    /// Alternative source paths; defaults to the column name
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldRule {
    pub fn new(column: &str, from: &[&str], kind: FieldKind) -> Self {
        Self {
            column: column.to_string(),
            from: from.iter().map(|s| s.to_string()).collect(),
            kind,
        }
    }

    /// Source paths to try, falling back to the column name
    pub fn source_paths(&self) -> Vec<String> {
        if self.from.is_empty() {
            vec![self.column.clone()]
        } else {
            self.from.clone()
        }
    }
}

/// Semantic type of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Whole number; missing or malformed input becomes `0` when additive,
    /// `default` when given, null otherwise
    Integer {
        #[serde(default)]
        additive: bool,
        #[serde(default)]
        default: Option<i64>,
    },
    /// Decimal; missing or malformed input becomes `0` when additive, null
    /// otherwise
    Decimal {
        #[serde(default)]
        additive: bool,
    },
    /// ISO-8601 timestamp; the first alternative that parses wins
    Timestamp,
    Enum { table: String },
    /// `total` minus the sum of `amount_field` over the `deductions` list,
    /// e.g. an order subtotal net of taxes
    NetOf {
        total: String,
        deductions: String,
        amount_field: String,
    },
    /// Fixed value regardless of the source
    Constant { value: String },
    /// Free-form nested document normalized element-wise
    Document,
    /// List of nested objects, each mapped with its own rules
    List { fields: Vec<FieldRule> },
}

/// Reference from this table to a parent table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRule {
    /// Column in this table holding the parent's target id
    pub column: String,
    pub parent: String,
    /// Source fields holding the parent's source id
    #[serde(default)]
    pub from: Vec<String>,
    /// Source fields holding the parent's secondary key (e.g. display name)
    #[serde(default)]
    pub secondary_from: Vec<String>,
    pub required: bool,
}

impl ForeignKeyRule {
    pub fn new(column: &str, parent: &str, from: &[&str], secondary_from: &[&str], required: bool) -> Self {
        Self {
            column: column.to_string(),
            parent: parent.to_string(),
            from: from.iter().map(|s| s.to_string()).collect(),
            secondary_from: secondary_from.iter().map(|s| s.to_string()).collect(),
            required,
        }
    }
}

impl MigrationConfig {
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Child collection types that must be fetched alongside `resource`
    pub fn child_types_of(&self, resource: &str) -> Vec<String> {
        let mut children: Vec<String> = Vec::new();
        for spec in &self.tables {
            if let Some(SourceBinding {
                resource: r,
                nested_under: Some(child),
            }) = &spec.source
            {
                if r == resource && !children.contains(child) {
                    children.push(child.clone());
                }
            }
        }
        children
    }

    /// Validate the configuration and build its dependency graph
    pub fn validate(&self) -> Result<DependencyGraph> {
        if self.tenant_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("tenant_id must be set".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(EngineError::InvalidConfig(
                "page_size must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.skip_rate_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "skip_rate_threshold must be between 0 and 1, got {}",
                self.skip_rate_threshold
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.tables {
            if !seen.insert(spec.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "table '{}' is declared twice",
                    spec.name
                )));
            }
            if spec.source_id_fields.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "table '{}' has no source_id_fields",
                    spec.name
                )));
            }
            self.validate_rules(&spec.name, &spec.fields)?;
        }

        DependencyGraph::from_specs(&self.tables)
    }

    fn validate_rules(&self, table: &str, rules: &[FieldRule]) -> Result<()> {
        for rule in rules {
            match &rule.kind {
                FieldKind::Enum { table: enum_name } if !self.enums.contains_key(enum_name) => {
                    return Err(EngineError::InvalidConfig(format!(
                        "column '{}.{}' uses unknown enum table '{}'",
                        table, rule.column, enum_name
                    )));
                },
                FieldKind::List { fields } => self.validate_rules(table, fields)?,
                _ => {},
            }
        }
        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
            strategies: vec![MatchStrategy::Direct, MatchStrategy::Secondary],
            ambiguity: AmbiguityPolicy::FirstWins,
            skip_rate_threshold: DEFAULT_SKIP_RATE_THRESHOLD,
            checkpoint_dir: None,
            rollback_timestamp_column: DEFAULT_TIMESTAMP_COLUMN.to_string(),
            enums: default_enums(),
            tables: default_tables(),
        }
    }
}

/// Status tables carried over from the ledger's sales order and invoice
/// workflows
pub fn default_enums() -> BTreeMap<String, EnumTable> {
    let mut enums = BTreeMap::new();
    enums.insert(
        "order_status".to_string(),
        EnumTable::new(
            "pending",
            &[
                ("open", "pending"),
                ("confirmed", "confirmed"),
                ("closed", "delivered"),
                ("cancelled", "cancelled"),
                ("fulfilled", "delivered"),
            ],
        ),
    );
    enums.insert(
        "invoice_status".to_string(),
        EnumTable::new(
            "draft",
            &[
                ("draft", "draft"),
                ("sent", "sent"),
                ("paid", "paid"),
                ("overdue", "overdue"),
                ("viewed", "received"),
                ("partially_paid", "sent"),
            ],
        ),
    );
    enums
}

/// customers, orders, order_line_items, invoices and shipments
pub fn default_tables() -> Vec<TableSpec> {
    use FieldKind::*;

    let additive_decimal = || Decimal { additive: true };
    let additive_integer = || Integer {
        additive: true,
        default: None,
    };

    vec![
        TableSpec {
            name: "customers".to_string(),
            source: Some(SourceBinding {
                resource: "customers".to_string(),
                nested_under: None,
            }),
            source_id_fields: vec!["firebase_uid".to_string(), "id".to_string()],
            source_key_column: "fb_customer_id".to_string(),
            tenant_column: Some("linked_company".to_string()),
            secondary_key: Some(SecondaryKeySpec {
                column: "display_name".to_string(),
            }),
            fields: vec![
                FieldRule::new("display_name", &["display_name", "customer_name", "billing_address.company_name"], Text),
                FieldRule::new("email", &["Primary_Email", "email", "auth_email"], Text),
                FieldRule::new("phone", &["phone", "mobile"], Text),
                FieldRule::new("billing_city", &["billing_address.city"], Text),
                FieldRule::new("billing_postcode", &["billing_address.zip", "billing_address.postcode"], Text),
                FieldRule::new("total_spent", &["total_spent", "metrics.total_spent"], Decimal { additive: false }),
                FieldRule::new("created_at", &["created_time", "created_at"], Timestamp),
                FieldRule::new("updated_at", &["last_modified_time", "created_time"], Timestamp),
            ],
            foreign_keys: vec![],
        },
        TableSpec {
            name: "orders".to_string(),
            source: Some(SourceBinding {
                resource: "sales_orders".to_string(),
                nested_under: None,
            }),
            source_id_fields: vec!["salesorder_number".to_string()],
            source_key_column: "legacy_order_number".to_string(),
            tenant_column: Some("company_id".to_string()),
            secondary_key: None,
            fields: vec![
                FieldRule::new("order_date", &["date"], Timestamp),
                FieldRule::new("order_status", &["order_status", "status"], Enum { table: "order_status".to_string() }),
                FieldRule::new("total", &["total"], additive_decimal()),
                FieldRule::new(
                    "sub_total",
                    &[],
                    NetOf {
                        total: "total".to_string(),
                        deductions: "taxes".to_string(),
                        amount_field: "tax_amount".to_string(),
                    },
                ),
                FieldRule::new("created_at", &["created_time"], Timestamp),
                FieldRule::new("updated_at", &["last_modified_time", "created_time"], Timestamp),
            ],
            foreign_keys: vec![ForeignKeyRule::new(
                "customer_id",
                "customers",
                &["customer_id"],
                &["customer_name"],
                true,
            )],
        },
        TableSpec {
            name: "order_line_items".to_string(),
            source: Some(SourceBinding {
                resource: "sales_orders".to_string(),
                nested_under: Some("order_line_items".to_string()),
            }),
            source_id_fields: vec!["line_item_id".to_string(), "id".to_string()],
            source_key_column: "legacy_line_item_id".to_string(),
            tenant_column: None,
            secondary_key: None,
            fields: vec![
                FieldRule::new("item_name", &["name"], Text),
                FieldRule::new("sku", &["sku"], Text),
                FieldRule::new("quantity", &["quantity"], additive_integer()),
                FieldRule::new("unit_price", &["rate"], additive_decimal()),
                FieldRule::new("total_price", &["item_total"], additive_decimal()),
                FieldRule::new("quantity_packed", &[], additive_integer()),
                FieldRule::new("quantity_shipped", &[], additive_integer()),
                FieldRule::new("quantity_delivered", &[], additive_integer()),
                FieldRule::new("quantity_invoiced", &[], additive_integer()),
                FieldRule::new("quantity_cancelled", &[], additive_integer()),
                FieldRule::new("quantity_returned", &[], additive_integer()),
            ],
            foreign_keys: vec![ForeignKeyRule::new(
                "order_id",
                "orders",
                &["_parent.salesorder_number"],
                &[],
                true,
            )],
        },
        TableSpec {
            name: "invoices".to_string(),
            source: Some(SourceBinding {
                resource: "invoices".to_string(),
                nested_under: None,
            }),
            source_id_fields: vec!["invoice_id".to_string(), "id".to_string()],
            source_key_column: "legacy_invoice_id".to_string(),
            tenant_column: Some("company_id".to_string()),
            secondary_key: None,
            fields: vec![
                FieldRule::new("order_type", &[], Constant { value: "sales_order".to_string() }),
                FieldRule::new("invoice_date", &["date", "invoice_date"], Timestamp),
                FieldRule::new("invoice_status", &["status"], Enum { table: "invoice_status".to_string() }),
                FieldRule::new("total", &["total"], additive_decimal()),
                FieldRule::new("balance", &["balance"], additive_decimal()),
                FieldRule::new(
                    "payment_terms",
                    &["payment_terms", "due_days"],
                    Integer {
                        additive: false,
                        default: Some(30),
                    },
                ),
                FieldRule::new("date_due", &["due_date"], Timestamp),
                FieldRule::new("created_at", &["created_time"], Timestamp),
                FieldRule::new("updated_at", &["last_modified_time", "created_time"], Timestamp),
            ],
            foreign_keys: vec![
                ForeignKeyRule::new("customer_id", "customers", &["customer_id"], &["customer_name"], true),
                ForeignKeyRule::new("order_id", "orders", &["salesorder_number", "reference_number"], &[], false),
            ],
        },
        TableSpec {
            name: "shipments".to_string(),
            source: None,
            source_id_fields: default_source_id_fields(),
            source_key_column: "legacy_shipment_id".to_string(),
            tenant_column: Some("company_id".to_string()),
            secondary_key: None,
            fields: vec![],
            foreign_keys: vec![ForeignKeyRule::new("order_id", "orders", &["salesorder_number"], &[], true)],
        },
    ]
}
