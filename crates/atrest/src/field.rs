//! Encrypted scalar columns.
//!
//! Values are encrypted on write and decrypted on read through
//! [`CryptoService`]. The column holds either hex ciphertext or legacy
//! plaintext; there is no marker column, so reads rely on the all-hex
//! heuristic and fall back to the stored value when decryption fails.

use std::collections::HashMap;

use thiserror::Error;

use crate::crypto::{CryptoError, CryptoService};

/// Raw column values of the in-memory record, keyed by column name.
pub type Record = HashMap<String, String>;

/// Errors from field encoding.
#[derive(Debug, Error)]
pub enum FieldError {
    /// The value is not one of the enum's declared options.
    #[error("value for {field} is not an allowed option")]
    NotAllowed { field: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Storage column description for an encrypted field.
///
/// Ciphertext is longer than any enum label and is hex, so encrypted columns
/// are always declared as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: &'static str,
    pub nullable: bool,
    pub default: Option<String>,
}

/// A single encrypted scalar column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedField {
    name: String,
    raw: Option<String>,
}

impl EncryptedField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value as stored: ciphertext, or legacy plaintext.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    /// Load the stored column value without touching it.
    pub fn hydrate(&mut self, stored: Option<String>) {
        self.raw = stored;
    }

    /// Decrypted value. Never fails; see [`CryptoService::decrypt_field`].
    pub fn read(&self, crypto: &CryptoService) -> Option<String> {
        self.raw.as_deref().map(|raw| crypto.decrypt_field(raw))
    }

    /// Encrypt `value` for persistence and return the column value to store.
    ///
    /// A `None` write keeps the prior raw value from `record` when there is
    /// one, so partial updates do not null the column. Passing ciphertext back
    /// in as `value` encrypts it a second time.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Crypto`] if the default key cannot be derived.
    pub fn write(
        &mut self,
        value: Option<&str>,
        record: &Record,
        crypto: &CryptoService,
    ) -> Result<Option<String>, FieldError> {
        self.raw = match value {
            Some(v) => Some(crypto.encrypt_field(v)?),
            None => record.get(&self.name).cloned(),
        };
        Ok(self.raw.clone())
    }

    pub fn column_spec(&self) -> ColumnSpec {
        ColumnSpec {
            name: self.name.clone(),
            data_type: "text",
            nullable: true,
            default: None,
        }
    }
}

/// An enumerated column stored encrypted.
///
/// Writes are checked against the declared options before encryption; reads
/// return whatever decrypts (or the raw value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnum {
    field: EncryptedField,
    options: Vec<String>,
    default: Option<String>,
}

impl EncryptedEnum {
    /// Declare an enum column. A `default` outside `options` is ignored.
    pub fn new<I, S>(name: impl Into<String>, options: I, default: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        let default = default
            .filter(|d| options.iter().any(|o| o == d))
            .map(str::to_owned);
        Self {
            field: EncryptedField::new(name),
            options,
            default,
        }
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn field(&self) -> &EncryptedField {
        &self.field
    }

    pub fn hydrate(&mut self, stored: Option<String>) {
        self.field.hydrate(stored);
    }

    pub fn read(&self, crypto: &CryptoService) -> Option<String> {
        self.field.read(crypto)
    }

    /// Validate and encrypt. A `None` write with no prior raw value stores the
    /// default option, if one is declared.
    ///
    /// # Errors
    ///
    /// [`FieldError::NotAllowed`] for values outside the options, including
    /// `""` unless it is itself an option.
    pub fn write(
        &mut self,
        value: Option<&str>,
        record: &Record,
        crypto: &CryptoService,
    ) -> Result<Option<String>, FieldError> {
        match value {
            Some(v) if !self.options.iter().any(|o| o == v) => {
                Err(FieldError::NotAllowed {
                    field: self.field.name.clone(),
                })
            }
            None if !record.contains_key(&self.field.name) => {
                let default = self.default.clone();
                self.field.write(default.as_deref(), record, crypto)
            }
            _ => self.field.write(value, record, crypto),
        }
    }

    /// Text, not null, with the plaintext default. Rows created from the
    /// column default read back through the plaintext fallback.
    pub fn column_spec(&self) -> ColumnSpec {
        ColumnSpec {
            name: self.field.name.clone(),
            data_type: "text",
            nullable: false,
            default: self.default.clone(),
        }
    }
}
