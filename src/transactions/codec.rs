//! Serialization of transaction records.
//!
//! `TextCodec` writes a human-readable patch:
//!
//! ```text
//! # Timestamp: 1700000000123
//! # Start Timestamp: 1700000000100
//! # User ID: 7c2f
//! # User Name: Jane Doe
//! # Commit Message: import
//!
//! D <http://example.org/s> <http://example.org/p> "old" .
//! A <http://example.org/s> <http://example.org/p> "new" .
//! ```
//!
//! `BincodeCodec` stores the same content compactly, with terms kept in N-Triples syntax.

use std::io::{BufRead, BufReader, Read, Write};

use serde::{Deserialize, Serialize};

use crate::core::syntax::{escape, format_statement, parse_statement, unescape};
use crate::error::{Error, Result};
use crate::transactions::record::TransactionRecord;

pub trait TransactionCodec: Send + Sync {
    fn write(&self, record: &TransactionRecord, out: &mut dyn Write) -> Result<()>;
    fn read(&self, input: &mut dyn Read) -> Result<TransactionRecord>;
}

/// Codec selection as it appears in the configuration file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Text,
    Bincode,
}

impl CodecKind {
    pub fn codec(self) -> Box<dyn TransactionCodec> {
        match self {
            CodecKind::Text => Box::new(TextCodec),
            CodecKind::Bincode => Box::new(BincodeCodec),
        }
    }
}

const TIMESTAMP: &str = "Timestamp";
const START_TIMESTAMP: &str = "Start Timestamp";
const USER_ID: &str = "User ID";
const USER_NAME: &str = "User Name";
const COMMIT_MESSAGE: &str = "Commit Message";

#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

impl TextCodec {
    fn header(out: &mut dyn Write, key: &str, value: &str) -> Result<()> {
        writeln!(out, "# {}: {}", key, escape(value))?;
        Ok(())
    }
}

impl TransactionCodec for TextCodec {
    fn write(&self, record: &TransactionRecord, out: &mut dyn Write) -> Result<()> {
        Self::header(out, TIMESTAMP, &record.commit_timestamp.to_string())?;
        Self::header(out, START_TIMESTAMP, &record.start_timestamp.to_string())?;
        if let Some(user_id) = &record.user_id {
            Self::header(out, USER_ID, user_id)?;
        }
        if let Some(user_name) = &record.user_name {
            Self::header(out, USER_NAME, user_name)?;
        }
        if let Some(message) = &record.commit_message {
            Self::header(out, COMMIT_MESSAGE, message)?;
        }
        writeln!(out)?;
        for statement in record.sorted_deleted() {
            writeln!(out, "D {}", format_statement(statement))?;
        }
        for statement in record.sorted_added() {
            writeln!(out, "A {}", format_statement(statement))?;
        }
        Ok(())
    }

    fn read(&self, input: &mut dyn Read) -> Result<TransactionRecord> {
        let mut record = TransactionRecord::default();
        for (number, line) in BufReader::new(input).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix("# ") {
                let Some((key, value)) = header.split_once(": ") else {
                    continue;
                };
                let value = unescape(value)?;
                match key {
                    TIMESTAMP => record.commit_timestamp = parse_millis(&value)?,
                    START_TIMESTAMP => record.start_timestamp = parse_millis(&value)?,
                    USER_ID => record.user_id = Some(value),
                    USER_NAME => record.user_name = Some(value),
                    COMMIT_MESSAGE => record.commit_message = Some(value),
                    _ => {}
                }
            } else if let Some(rest) = line.strip_prefix("D ") {
                record.deleted.insert(parse_statement(rest)?);
            } else if let Some(rest) = line.strip_prefix("A ") {
                record.added.insert(parse_statement(rest)?);
            } else {
                return Err(Error::Codec(format!("Unexpected line {}: {}", number + 1, line)));
            }
        }
        Ok(record)
    }
}

fn parse_millis(value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| Error::Codec(format!("Invalid timestamp: {}", value)))
}

#[derive(Serialize, Deserialize)]
struct EncodedRecord {
    start_timestamp: u64,
    commit_timestamp: u64,
    user_id: Option<String>,
    user_name: Option<String>,
    commit_message: Option<String>,
    deleted: Vec<String>,
    added: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl TransactionCodec for BincodeCodec {
    fn write(&self, record: &TransactionRecord, out: &mut dyn Write) -> Result<()> {
        let encoded = EncodedRecord {
            start_timestamp: record.start_timestamp,
            commit_timestamp: record.commit_timestamp,
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            commit_message: record.commit_message.clone(),
            deleted: record.sorted_deleted().into_iter().map(format_statement).collect(),
            added: record.sorted_added().into_iter().map(format_statement).collect(),
        };
        let bytes = bincode::serialize(&encoded)?;
        out.write_all(&bytes)?;
        Ok(())
    }

    fn read(&self, input: &mut dyn Read) -> Result<TransactionRecord> {
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer)?;
        let encoded: EncodedRecord = bincode::deserialize(&buffer)?;
        let mut record = TransactionRecord {
            start_timestamp: encoded.start_timestamp,
            commit_timestamp: encoded.commit_timestamp,
            user_id: encoded.user_id,
            user_name: encoded.user_name,
            commit_message: encoded.commit_message,
            ..TransactionRecord::default()
        };
        for line in &encoded.deleted {
            record.deleted.insert(parse_statement(line)?);
        }
        for line in &encoded.added {
            record.added.insert(parse_statement(line)?);
        }
        Ok(record)
    }
}
