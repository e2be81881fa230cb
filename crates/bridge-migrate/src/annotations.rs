//! Record to annotation mapping.
//!
//! Annotations are attached to the stored file and copied verbatim as the
//! object's user metadata. Every value is a string.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::services::common::cell_to_string;
use crate::services::{Metadata, Record};

/// Source column names.
pub mod columns {
    /// Record identifier.
    pub const RECORD_ID: &str = "recordId";
    /// Participant health code.
    pub const HEALTH_CODE: &str = "healthCode";
    /// Creation time in epoch millis.
    pub const CREATED_ON: &str = "createdOn";
    /// Task identifier, stored under the `metadata.` prefix.
    pub const TASK_IDENTIFIER: &str = "metadata.taskIdentifier";
    /// Substudy memberships.
    pub const SUBSTUDY_MEMBERSHIPS: &str = "substudyMemberships";
    /// Device description.
    pub const PHONE_INFO: &str = "phoneInfo";
    /// App version.
    pub const APP_VERSION: &str = "appVersion";
    /// Time zone of `createdOn`.
    pub const CREATED_ON_TIME_ZONE: &str = "createdOnTimeZone";
    /// Day in study.
    pub const DAY_IN_STUDY: &str = "dayInStudy";
    /// Data type.
    pub const DATA_TYPE: &str = "dataType";
    /// Data groups.
    pub const DATA_GROUPS: &str = "dataGroups";
}

/// Value of the `exporterVersion` annotation.
pub const EXPORTER_VERSION: &str = "3";

/// Which annotation keys to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSchema {
    /// The five core keys.
    #[default]
    Minimal,
    /// Core keys plus upload and device details.
    Extended,
}

/// The five core annotation keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalAnnotations {
    /// `recordId`.
    pub record_id: String,
    /// `healthCode`.
    pub health_code: String,
    /// `createdOn`, epoch millis.
    pub created_on: String,
    /// `metadata.taskIdentifier`.
    pub task_identifier: String,
    /// `substudyMemberships`.
    pub substudy_memberships: String,
}

/// The extended annotation keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedAnnotations {
    /// Core keys.
    #[serde(flatten)]
    pub base: MinimalAnnotations,
    /// `createdOn` as an ISO-8601 timestamp.
    pub uploaded_on: String,
    /// Same as `taskIdentifier`.
    pub assessment_id: String,
    /// `phoneInfo`.
    pub phone_info: String,
    /// `appVersion`.
    pub app_version: String,
    /// `createdOnTimeZone`.
    pub created_on_time_zone: String,
    /// `dayInStudy`.
    pub day_in_study: String,
    /// `dataType`.
    pub data_type: String,
    /// `dataGroups`.
    pub data_groups: String,
    /// Always [`EXPORTER_VERSION`].
    pub exporter_version: String,
}

/// Annotations for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Annotations {
    /// Extended schema.
    Extended(ExtendedAnnotations),
    /// Minimal schema.
    Minimal(MinimalAnnotations),
}

fn string_column(record: &Record<'_>, column: &str) -> Result<String> {
    record.require(column).map(cell_to_string)
}

impl MinimalAnnotations {
    /// Maps the core columns of `record`.
    pub fn from_record(record: &Record<'_>) -> Result<Self> {
        Ok(Self {
            record_id: string_column(record, columns::RECORD_ID)?,
            health_code: string_column(record, columns::HEALTH_CODE)?,
            created_on: string_column(record, columns::CREATED_ON)?,
            task_identifier: string_column(record, columns::TASK_IDENTIFIER)?,
            substudy_memberships: string_column(record, columns::SUBSTUDY_MEMBERSHIPS)?,
        })
    }

    fn push_pairs(&self, metadata: &mut Metadata) {
        metadata.insert("recordId".to_string(), self.record_id.clone());
        metadata.insert("healthCode".to_string(), self.health_code.clone());
        metadata.insert("createdOn".to_string(), self.created_on.clone());
        metadata.insert("taskIdentifier".to_string(), self.task_identifier.clone());
        metadata.insert(
            "substudyMemberships".to_string(),
            self.substudy_memberships.clone(),
        );
    }
}

impl ExtendedAnnotations {
    /// Maps the extended columns of `record`.
    pub fn from_record(record: &Record<'_>) -> Result<Self> {
        let base = MinimalAnnotations::from_record(record)?;
        let uploaded_on = format_uploaded_on(&base.created_on)?;
        Ok(Self {
            uploaded_on,
            assessment_id: base.task_identifier.clone(),
            phone_info: string_column(record, columns::PHONE_INFO)?,
            app_version: string_column(record, columns::APP_VERSION)?,
            created_on_time_zone: string_column(record, columns::CREATED_ON_TIME_ZONE)?,
            day_in_study: string_column(record, columns::DAY_IN_STUDY)?,
            data_type: string_column(record, columns::DATA_TYPE)?,
            data_groups: string_column(record, columns::DATA_GROUPS)?,
            exporter_version: EXPORTER_VERSION.to_string(),
            base,
        })
    }
}

impl Annotations {
    /// Maps `record` under `schema`. The record is only read.
    pub fn from_record(record: &Record<'_>, schema: AnnotationSchema) -> Result<Self> {
        match schema {
            AnnotationSchema::Minimal => MinimalAnnotations::from_record(record).map(Self::Minimal),
            AnnotationSchema::Extended => {
                ExtendedAnnotations::from_record(record).map(Self::Extended)
            }
        }
    }

    /// The record id.
    #[must_use]
    pub fn record_id(&self) -> &str {
        match self {
            Self::Minimal(a) => &a.record_id,
            Self::Extended(a) => &a.base.record_id,
        }
    }

    /// Flattened key/value pairs.
    #[must_use]
    pub fn to_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        match self {
            Self::Minimal(a) => a.push_pairs(&mut metadata),
            Self::Extended(a) => {
                a.base.push_pairs(&mut metadata);
                metadata.insert("uploadedOn".to_string(), a.uploaded_on.clone());
                metadata.insert("assessmentId".to_string(), a.assessment_id.clone());
                metadata.insert("phoneInfo".to_string(), a.phone_info.clone());
                metadata.insert("appVersion".to_string(), a.app_version.clone());
                metadata.insert(
                    "createdOnTimeZone".to_string(),
                    a.created_on_time_zone.clone(),
                );
                metadata.insert("dayInStudy".to_string(), a.day_in_study.clone());
                metadata.insert("dataType".to_string(), a.data_type.clone());
                metadata.insert("dataGroups".to_string(), a.data_groups.clone());
                metadata.insert("exporterVersion".to_string(), a.exporter_version.clone());
            }
        }
        metadata
    }
}

/// Renders epoch millis as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_uploaded_on(created_on: &str) -> Result<String> {
    let invalid = || Error::InvalidValue {
        column: columns::CREATED_ON.to_string(),
        value: created_on.to_string(),
    };
    let millis = match created_on.trim().parse::<i64>() {
        Ok(millis) => millis,
        Err(_) => {
            let value: f64 = created_on.trim().parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            #[allow(clippy::cast_possible_truncation)]
            let millis = value.trunc() as i64;
            millis
        }
    };
    let timestamp = DateTime::from_timestamp_millis(millis).ok_or_else(invalid)?;
    Ok(timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

#[cfg(test)]
#[path = "annotations_tests.rs"]
mod tests;
