//! Source file layouts and target tables
//!
//! The catalog is fixed: each register publishes a known set of files, and each file has a
//! positional column layout. Mapping looks fields up by [`Field`] rather than by position,
//! so a layout change only touches the tables below.
//!
//! # Address register (`aw_csv.zip`)
//!
//! | file | level | quote | columns |
//! |---|---|---|---|
//! | `AW_NOVADS.CSV` | region | `#` | 10 |
//! | `AW_PILSETA.CSV` | city | `#` | 14 |
//! | `AW_PAGASTS.CSV` | parish | `#` | 14 |
//! | `AW_CIEMS.CSV` | village | `#` | 14 |
//! | `AW_IELA.CSV` | street | `#` | 14 |
//! | `AW_EKA.CSV` | building | `"` | 17 |
//! | `AW_DZIV.CSV` | flat | `"` | 12 |
//!
//! # Company register
//!
//! A single `register.csv`, double-quoted, 21 columns.

use serde::{Deserialize, Serialize};

use crate::models::AddressLevel;

/// A published reference register
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Address,
    Company,
}

impl RegisterKind {
    pub const ALL: [RegisterKind; 2] = [RegisterKind::Address, RegisterKind::Company];

    pub fn as_str(self) -> &'static str {
        match self {
            RegisterKind::Address => "address",
            RegisterKind::Company => "company",
        }
    }

    pub fn table(self) -> &'static TableDescriptor {
        match self {
            RegisterKind::Address => &ADDRESS_TABLE,
            RegisterKind::Company => &COMPANY_TABLE,
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Meaning of a source column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ExternalCode,
    TypeCode,
    TypeName,
    Status,
    ParentCode,
    ParentTypeCode,
    Name,
    NameBeforeQuotes,
    NameInQuotes,
    NameAfterQuotes,
    SortKey,
    FullName,
    Address,
    PostalCode,
    RegionCode,
    ValidFrom,
    ValidTo,
    UpdatedOn,
    Ignored,
}

/// One positional column of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Header name as published
    pub name: &'static str,
    pub field: Field,
}

const fn col(name: &'static str, field: Field) -> Column {
    Column { name, field }
}

/// Record shape a file maps into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTarget {
    Address(AddressLevel),
    Company,
}

/// What to do with a row whose shape or values do not fit the layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowPolicy {
    /// Abort the file, and with it the run
    #[default]
    FailFast,
    /// Log the row and carry on
    SkipAndLog,
}

/// Layout of one source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry {
    pub file_name: &'static str,
    pub separator: char,
    pub quote: char,
    pub skip_header_lines: usize,
    pub columns: &'static [Column],
    pub target: RecordTarget,
    /// Status value the source uses to flag rows it considers erroneous
    pub error_status: Option<&'static str>,
    pub row_policy: RowPolicy,
}

impl SchemaEntry {
    pub fn expected_fields(&self) -> usize {
        self.columns.len()
    }

    /// Position of the first column carrying `field`
    pub fn position(&self, field: Field) -> Option<usize> {
        self.columns.iter().position(|c| c.field == field)
    }

    pub fn column_name(&self, field: Field) -> &'static str {
        self.columns
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.name)
            .unwrap_or("?")
    }

    pub fn with_row_policy(mut self, row_policy: RowPolicy) -> Self {
        self.row_policy = row_policy;
        self
    }
}

/// Secondary index maintained on a target table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub column: &'static str,
}

/// Target table of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub indexes: &'static [IndexDef],
}

impl TableDescriptor {
    /// Table new data is staged in when loading with a shadow swap
    pub fn shadow_name(&self) -> String {
        format!("{}_shadow", self.name)
    }
}

// ============================================================================
// Address register
// ============================================================================

use Field::*;

/// Shared layout of region-below administrative units and streets
const ADMIN_UNIT_COLUMNS: &[Column] = &[
    col("KODS", ExternalCode),
    col("TIPS_CD", TypeCode),
    col("NOSAUKUMS", Name),
    col("VKUR_CD", ParentCode),
    col("VKUR_TIPS", ParentTypeCode),
    col("APSTIPR", Ignored),
    col("APST_PAK", Ignored),
    col("STATUSS", Status),
    col("SORT_NOS", SortKey),
    col("DAT_SAK", ValidFrom),
    col("DAT_MOD", UpdatedOn),
    col("DAT_BEIG", ValidTo),
    col("ATRIB", RegionCode),
    col("STD", FullName),
];

const REGION_COLUMNS: &[Column] = &[
    col("KODS", ExternalCode),
    col("TIPS_CD", TypeCode),
    col("NOSAUKUMS", Name),
    col("STATUSS", Status),
    col("SORT_NOS", SortKey),
    col("DAT_SAK", ValidFrom),
    col("DAT_MOD", UpdatedOn),
    col("DAT_BEIG", ValidTo),
    col("ATRIB", RegionCode),
    col("STD", FullName),
];

const BUILDING_COLUMNS: &[Column] = &[
    col("KODS", ExternalCode),
    col("TIPS_CD", TypeCode),
    col("STATUSS", Status),
    col("APSTIPR", Ignored),
    col("APST_PAK", Ignored),
    col("VKUR_CD", ParentCode),
    col("VKUR_TIPS", ParentTypeCode),
    col("NOSAUKUMS", Name),
    col("SORT_NOS", SortKey),
    col("ATRIB", PostalCode),
    col("PNOD_CD", RegionCode),
    col("DAT_SAK", ValidFrom),
    col("DAT_MOD", UpdatedOn),
    col("DAT_BEIG", ValidTo),
    col("FOR_BUILD", Ignored),
    col("PLAN_ADR", Ignored),
    col("STD", FullName),
];

const FLAT_COLUMNS: &[Column] = &[
    col("KODS", ExternalCode),
    col("TIPS_CD", TypeCode),
    col("STATUSS", Status),
    col("APSTIPR", Ignored),
    col("VKUR_CD", ParentCode),
    col("VKUR_TIPS", ParentTypeCode),
    col("NOSAUKUMS", Name),
    col("SORT_NOS", SortKey),
    col("DAT_SAK", ValidFrom),
    col("DAT_MOD", UpdatedOn),
    col("DAT_BEIG", ValidTo),
    col("STD", FullName),
];

const fn address_file(
    file_name: &'static str,
    quote: char,
    columns: &'static [Column],
    level: AddressLevel,
) -> SchemaEntry {
    SchemaEntry {
        file_name,
        separator: ';',
        quote,
        skip_header_lines: 1,
        columns,
        target: RecordTarget::Address(level),
        error_status: Some("ERR"),
        row_policy: RowPolicy::FailFast,
    }
}

const ADDRESS_FILES: &[SchemaEntry] = &[
    address_file("AW_NOVADS.CSV", '#', REGION_COLUMNS, AddressLevel::Region),
    address_file("AW_PILSETA.CSV", '#', ADMIN_UNIT_COLUMNS, AddressLevel::City),
    address_file("AW_PAGASTS.CSV", '#', ADMIN_UNIT_COLUMNS, AddressLevel::Parish),
    address_file("AW_CIEMS.CSV", '#', ADMIN_UNIT_COLUMNS, AddressLevel::Village),
    address_file("AW_IELA.CSV", '#', ADMIN_UNIT_COLUMNS, AddressLevel::Street),
    address_file("AW_EKA.CSV", '"', BUILDING_COLUMNS, AddressLevel::Building),
    address_file("AW_DZIV.CSV", '"', FLAT_COLUMNS, AddressLevel::Flat),
];

const ADDRESS_TABLE: TableDescriptor = TableDescriptor {
    name: "address_entries",
    columns: &[
        "code",
        "type_code",
        "level",
        "status",
        "parent_code",
        "parent_type_code",
        "name",
        "sort_name",
        "postal_code",
        "valid_from",
        "valid_to",
        "updated_on",
        "full_name",
        "region_code",
    ],
    indexes: &[
        IndexDef { name: "idx_address_entries_code", column: "code" },
        IndexDef { name: "idx_address_entries_parent_code", column: "parent_code" },
        IndexDef { name: "idx_address_entries_full_name", column: "full_name" },
    ],
};

// ============================================================================
// Company register
// ============================================================================

const COMPANY_COLUMNS: &[Column] = &[
    col("regcode", ExternalCode),
    col("sepa", Ignored),
    col("name", Name),
    col("name_before_quotes", NameBeforeQuotes),
    col("name_in_quotes", NameInQuotes),
    col("name_after_quotes", NameAfterQuotes),
    col("without_quotes", Ignored),
    col("regtype", Ignored),
    col("regtype_text", Ignored),
    col("type", TypeCode),
    col("type_text", TypeName),
    col("registered", ValidFrom),
    col("terminated", ValidTo),
    col("closed", Status),
    col("address", Address),
    col("index", PostalCode),
    col("addressid", ParentCode),
    col("region", Ignored),
    col("city", Ignored),
    col("atvk", RegionCode),
    col("reregistration_term", Ignored),
];

const COMPANY_FILES: &[SchemaEntry] = &[SchemaEntry {
    file_name: "register.csv",
    separator: ';',
    quote: '"',
    skip_header_lines: 1,
    columns: COMPANY_COLUMNS,
    target: RecordTarget::Company,
    error_status: None,
    row_policy: RowPolicy::FailFast,
}];

const COMPANY_TABLE: TableDescriptor = TableDescriptor {
    name: "company_entries",
    columns: &[
        "reg_code",
        "type_code",
        "type_name",
        "status",
        "address_code",
        "name",
        "display_name",
        "sort_name",
        "address",
        "postal_code",
        "registered_on",
        "terminated_on",
        "updated_on",
        "region_code",
    ],
    indexes: &[
        IndexDef { name: "idx_company_entries_reg_code", column: "reg_code" },
        IndexDef { name: "idx_company_entries_address_code", column: "address_code" },
        IndexDef { name: "idx_company_entries_display_name", column: "display_name" },
    ],
};

/// Fixed mapping from expected file names to layouts
pub struct SchemaCatalog;

impl SchemaCatalog {
    /// Files a register snapshot must contain, in load order
    pub fn entries(register: RegisterKind) -> &'static [SchemaEntry] {
        match register {
            RegisterKind::Address => ADDRESS_FILES,
            RegisterKind::Company => COMPANY_FILES,
        }
    }

    pub fn lookup(file_name: &str) -> Option<&'static SchemaEntry> {
        ADDRESS_FILES
            .iter()
            .chain(COMPANY_FILES)
            .find(|entry| entry.file_name.eq_ignore_ascii_case(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_register_has_seven_files() {
        let entries = SchemaCatalog::entries(RegisterKind::Address);
        assert_eq!(entries.len(), 7);

        for entry in entries {
            assert_eq!(entry.separator, ';');
            assert_eq!(entry.skip_header_lines, 1);
            assert!((7..=17).contains(&entry.expected_fields()), "{}", entry.file_name);
            assert_eq!(entry.position(Field::ExternalCode), Some(0));
            assert_eq!(entry.position(Field::TypeCode), Some(1));
            assert_eq!(entry.error_status, Some("ERR"));
        }
    }

    #[test]
    fn test_quote_characters_differ_per_file() {
        assert_eq!(SchemaCatalog::lookup("AW_IELA.CSV").map(|e| e.quote), Some('#'));
        assert_eq!(SchemaCatalog::lookup("AW_EKA.CSV").map(|e| e.quote), Some('"'));
    }

    #[test]
    fn test_company_register_layout() {
        let entries = SchemaCatalog::entries(RegisterKind::Company);
        assert_eq!(entries.len(), 1);

        let entry = entries[0];
        assert_eq!(entry.expected_fields(), 21);
        assert_eq!(entry.target, RecordTarget::Company);
        assert_eq!(entry.position(Field::NameInQuotes), Some(4));
        assert_eq!(entry.column_name(Field::ValidTo), "terminated");
        assert_eq!(entry.error_status, None);
    }

    #[test]
    fn test_company_table_indexes_display_name() {
        let columns: Vec<&str> = RegisterKind::Company
            .table()
            .indexes
            .iter()
            .map(|index| index.column)
            .collect();
        assert_eq!(columns, vec!["reg_code", "address_code", "display_name"]);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(SchemaCatalog::lookup("aw_dziv.csv").is_some());
        assert!(SchemaCatalog::lookup("AW_UNKNOWN.CSV").is_none());
    }

    #[test]
    fn test_table_columns_match_index_columns() {
        for register in RegisterKind::ALL {
            let table = register.table();
            assert_eq!(table.indexes.len(), 3);
            for index in table.indexes {
                assert!(table.columns.contains(&index.column), "{}", index.name);
            }
        }
        assert_eq!(RegisterKind::Address.table().shadow_name(), "address_entries_shadow");
    }

    #[test]
    fn test_row_policy_override() {
        let entry = SchemaCatalog::entries(RegisterKind::Address)[4];
        assert_eq!(entry.row_policy, RowPolicy::FailFast);
        assert_eq!(entry.with_row_policy(RowPolicy::SkipAndLog).row_policy, RowPolicy::SkipAndLog);
    }
}
