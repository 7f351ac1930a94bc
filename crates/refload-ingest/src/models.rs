//! Row and record types flowing through an import
//!
//! Bytes become [`RawRow`]s in the tokenizer, the mapper turns those into
//! [`NormalizedRecord`]s, and the loader persists them. Records carry no identity of their
//! own across runs; only their external code is stable.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog::RegisterKind;

/// One logical CSV record, possibly assembled from several physical lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// Physical line (1-based) on which the record started
    pub line: usize,
    pub fields: Vec<String>,
}

impl RawRow {
    pub fn new(line: usize, fields: Vec<String>) -> Self {
        Self { line, fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Geographic level of an address-register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressLevel {
    Region,
    City,
    Parish,
    Village,
    Street,
    Building,
    Flat,
}

impl AddressLevel {
    /// Stored in the `level` column so rows from different files stay distinguishable
    pub fn code(self) -> i16 {
        match self {
            AddressLevel::Region => 1,
            AddressLevel::City => 2,
            AddressLevel::Parish => 3,
            AddressLevel::Village => 4,
            AddressLevel::Street => 5,
            AddressLevel::Building => 6,
            AddressLevel::Flat => 7,
        }
    }
}

/// Normalized address-register row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub code: i64,
    pub type_code: i32,
    pub level: AddressLevel,
    pub status: String,
    pub parent_code: i64,
    pub parent_type_code: i32,
    pub name: String,
    pub sort_name: String,
    pub postal_code: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub updated_on: NaiveDate,
    pub full_name: String,
    pub region_code: Option<String>,
}

/// Normalized company-register row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyEntry {
    pub reg_code: i64,
    pub type_code: String,
    pub type_name: String,
    /// Closure marker as published; `None` for active companies
    pub status: Option<String>,
    /// Address-register code of the legal address, 0 when unknown
    pub address_code: i64,
    pub name: String,
    pub display_name: String,
    pub sort_name: String,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub registered_on: Option<NaiveDate>,
    pub terminated_on: Option<NaiveDate>,
    pub updated_on: NaiveDate,
    pub region_code: Option<String>,
}

/// A mapped row ready for loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Address(AddressEntry),
    Company(CompanyEntry),
}

impl NormalizedRecord {
    /// Register whose table the record belongs in
    pub fn register(&self) -> RegisterKind {
        match self {
            NormalizedRecord::Address(_) => RegisterKind::Address,
            NormalizedRecord::Company(_) => RegisterKind::Company,
        }
    }

    /// Code that downstream consumers join on
    pub fn external_code(&self) -> i64 {
        match self {
            NormalizedRecord::Address(entry) => entry.code,
            NormalizedRecord::Company(entry) => entry.reg_code,
        }
    }
}
