use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{AdvisorError, Result};
use crate::schema::{AnalysisResult, ProfileType, ValidatedRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInputs {
    pub jurisdiction: String,
    pub profile_type: ProfileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_period: Option<String>,
}

impl From<&ValidatedRequest<'_>> for ReportInputs {
    fn from(request: &ValidatedRequest<'_>) -> Self {
        Self {
            jurisdiction: request.jurisdiction.to_string(),
            profile_type: request.profile_type,
            tax_period: request.tax_period.map(str::to_string),
        }
    }
}

/// A saved analysis. Only `name` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub result: AnalysisResult,
    pub inputs: ReportInputs,
}

impl Report {
    pub fn new(name: impl Into<String>, result: AnalysisResult, inputs: ReportInputs) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
            result,
            inputs,
        }
    }

    /// Names the report after its inputs, e.g. "India - Corporation (FY2023-24)".
    pub fn named_after_inputs(result: AnalysisResult, inputs: ReportInputs) -> Self {
        let mut name = format!("{} - {}", inputs.jurisdiction, inputs.profile_type);
        if let Some(period) = &inputs.tax_period {
            name.push_str(&format!(" ({})", period));
        }
        Self::new(name, result, inputs)
    }
}

/// Key-value persistence for reports, keyed by [`Report::id`].
pub trait ReportStore {
    fn add(&mut self, report: Report) -> Result<()>;

    /// All reports, oldest first.
    fn list(&self) -> Result<Vec<Report>>;

    fn get(&self, id: &str) -> Result<Option<Report>>;

    fn rename(&mut self, id: &str, new_name: &str) -> Result<()>;

    fn delete(&mut self, id: &str) -> Result<()>;

    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    reports: Vec<Report>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportStore for InMemoryReportStore {
    fn add(&mut self, report: Report) -> Result<()> {
        insert_report(&mut self.reports, report)
    }

    fn list(&self) -> Result<Vec<Report>> {
        Ok(self.reports.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Report>> {
        Ok(self.reports.iter().find(|r| r.id == id).cloned())
    }

    fn rename(&mut self, id: &str, new_name: &str) -> Result<()> {
        rename_report(&mut self.reports, id, new_name)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        delete_report(&mut self.reports, id)
    }

    fn clear(&mut self) -> Result<()> {
        self.reports.clear();
        Ok(())
    }
}

/// Stores the whole history as one JSON array, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileReportStore {
    path: PathBuf,
    reports: Vec<Report>,
}

impl JsonFileReportStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let reports = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Vec::new()
        };

        debug!("Opened report store {:?} with {} report(s)", path, reports.len());
        Ok(Self { path, reports })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `next` to disk and only then adopts it, so a failed write leaves
    /// the in-memory list matching the file.
    fn commit(&mut self, next: Vec<Report>) -> Result<()> {
        self.persist(&next)?;
        self.reports = next;
        Ok(())
    }

    fn persist(&self, reports: &[Report]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(reports)?)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            warn!("Failed to replace report store {:?}: {}", self.path, e);
            AdvisorError::Io(e)
        })
    }
}

impl ReportStore for JsonFileReportStore {
    fn add(&mut self, report: Report) -> Result<()> {
        let mut next = self.reports.clone();
        insert_report(&mut next, report)?;
        self.commit(next)
    }

    fn list(&self) -> Result<Vec<Report>> {
        Ok(self.reports.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Report>> {
        Ok(self.reports.iter().find(|r| r.id == id).cloned())
    }

    fn rename(&mut self, id: &str, new_name: &str) -> Result<()> {
        let mut next = self.reports.clone();
        rename_report(&mut next, id, new_name)?;
        self.commit(next)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        let mut next = self.reports.clone();
        delete_report(&mut next, id)?;
        self.commit(next)
    }

    fn clear(&mut self) -> Result<()> {
        self.commit(Vec::new())
    }
}

fn insert_report(reports: &mut Vec<Report>, report: Report) -> Result<()> {
    if reports.iter().any(|r| r.id == report.id) {
        return Err(AdvisorError::Validation(format!(
            "a report with id {} already exists",
            report.id
        )));
    }
    reports.push(report);
    Ok(())
}

fn rename_report(reports: &mut [Report], id: &str, new_name: &str) -> Result<()> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err(AdvisorError::Validation(
            "report name must not be empty".to_string(),
        ));
    }

    let report = reports
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| AdvisorError::ReportNotFound(id.to_string()))?;
    report.name = new_name.to_string();
    Ok(())
}

fn delete_report(reports: &mut Vec<Report>, id: &str) -> Result<()> {
    let before = reports.len();
    reports.retain(|r| r.id != id);
    if reports.len() == before {
        return Err(AdvisorError::ReportNotFound(id.to_string()));
    }
    Ok(())
}
