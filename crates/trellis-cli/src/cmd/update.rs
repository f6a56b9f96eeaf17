//! `trl update` and the field flags it shares with `trl create`.

use crate::cmd::issue_line;
use crate::output::{OutputMode, pretty_kv, render};
use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use clap::Args;
use serde_json::{Value, json};
use std::io::Write;
use trellis_core::codec::record_value;
use trellis_core::{DepKind, IssueId, IssuePatch, Kind, Priority, Project, Status};

/// Field flags accepted by both `create` and `update`.
#[derive(Args, Debug, Default)]
pub struct FieldArgs {
    /// Long-form description.
    #[arg(short, long)]
    pub description: Option<String>,

    /// Free-form working notes.
    #[arg(long)]
    pub notes: Option<String>,

    /// Issue kind (bug, feature, task, epic, chore).
    #[arg(short, long)]
    pub kind: Option<Kind>,

    /// Status (open, in_progress, blocked, deferred, closed).
    #[arg(short, long)]
    pub status: Option<Status>,

    /// Priority 0-4, 0 most urgent; `P1` also accepted.
    #[arg(short, long)]
    pub priority: Option<Priority>,

    /// Who is working on it.
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Parent issue (alias or id).
    #[arg(long)]
    pub parent: Option<String>,

    /// Label to add. Repeatable.
    #[arg(short, long = "label")]
    pub labels: Vec<String>,

    /// Dependency to add as `KEY` (blocks) or `KIND:KEY`. Repeatable.
    #[arg(long = "dep")]
    pub deps: Vec<String>,

    /// Due date, `YYYY-MM-DD` or RFC 3339.
    #[arg(long, value_parser = parse_when)]
    pub due: Option<DateTime<Utc>>,

    /// Hide until this date, `YYYY-MM-DD` or RFC 3339.
    #[arg(long, value_parser = parse_when)]
    pub defer: Option<DateTime<Utc>>,

    /// Extension field as `KEY=VALUE`; VALUE is JSON if it parses, else text.
    #[arg(long = "set", value_parser = parse_extra)]
    pub extra: Vec<(String, Value)>,
}

impl FieldArgs {
    /// Translate flags into a patch, resolving issue references.
    pub fn to_patch(&self, project: &Project) -> Result<IssuePatch> {
        let parent = self
            .parent
            .as_deref()
            .map(|key| project.resolve_key(key))
            .transpose()?;
        let mut add_deps = Vec::with_capacity(self.deps.len());
        for raw in &self.deps {
            let (kind, key) = parse_dep(raw)?;
            add_deps.push((project.resolve_key(key)?, kind));
        }
        Ok(IssuePatch {
            description: self.description.clone().map(Some),
            notes: self.notes.clone().map(Some),
            kind: self.kind,
            status: self.status,
            priority: self.priority,
            assignee: self.assignee.clone().map(Some),
            parent: parent.map(Some),
            due_at: self.due.map(Some),
            defer_until: self.defer.map(Some),
            add_labels: self.labels.iter().map(|l| l.trim().to_string()).collect(),
            add_deps,
            set_extra: self.extra.clone(),
            ..IssuePatch::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Issue to change (alias or id).
    pub id: String,

    /// New title.
    #[arg(short, long)]
    pub title: Option<String>,

    #[command(flatten)]
    pub fields: FieldArgs,

    /// Label to remove. Repeatable.
    #[arg(long = "remove-label")]
    pub remove_labels: Vec<String>,

    /// Dependency to remove (alias or id). Repeatable.
    #[arg(long = "remove-dep")]
    pub remove_deps: Vec<String>,

    /// Extension field to remove. Repeatable.
    #[arg(long)]
    pub unset: Vec<String>,

    /// Field to clear: description, notes, assignee, parent, due, defer.
    #[arg(long, value_name = "FIELD")]
    pub clear: Vec<String>,
}

impl UpdateArgs {
    fn to_patch(&self, project: &Project) -> Result<IssuePatch> {
        let mut patch = self.fields.to_patch(project)?;
        patch.title = self.title.clone();
        patch.remove_labels.clone_from(&self.remove_labels);
        patch.remove_deps = self
            .remove_deps
            .iter()
            .map(|key| project.resolve_key(key))
            .collect::<Result<Vec<IssueId>, _>>()?;
        patch.remove_extra.clone_from(&self.unset);
        for field in &self.clear {
            match field.as_str() {
                "description" => patch.description = Some(None),
                "notes" => patch.notes = Some(None),
                "assignee" => patch.assignee = Some(None),
                "parent" => patch.parent = Some(None),
                "due" => patch.due_at = Some(None),
                "defer" => patch.defer_until = Some(None),
                other => bail!("cannot clear `{other}`"),
            }
        }
        Ok(patch)
    }
}

/// Execute `trl update <id> ...`.
///
/// # Errors
///
/// Returns an error if the issue or a referenced issue does not exist, or a
/// value is invalid. Nothing is written in that case.
pub fn run_update(args: &UpdateArgs, project: &Project, output: OutputMode) -> Result<()> {
    let patch = args.to_patch(project)?;
    if patch.is_empty() {
        bail!("nothing to update; pass at least one field flag");
    }
    let outcome = project.update(&args.id, &patch)?;
    let changed: Vec<&str> = outcome.changed.iter().map(|f| f.name()).collect();
    let value = json!({
        "changed": changed,
        "issue": record_value(&outcome.issue),
    });
    render(output, &value, |_, w| {
        if changed.is_empty() {
            writeln!(w, "{} unchanged", outcome.issue.alias)?;
        } else {
            writeln!(w, "{}", issue_line(&outcome.issue))?;
            pretty_kv(w, "changed", changed.join(", "))?;
            pretty_kv(w, "version", outcome.issue.version.to_string())?;
        }
        Ok(())
    })
}

/// Parse `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_when(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("expected YYYY-MM-DD or RFC 3339, got `{raw}`"))
}

fn parse_extra(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("extension key must not be empty".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_dep(raw: &str) -> Result<(DepKind, &str)> {
    match raw.split_once(':') {
        Some((kind, key)) => {
            let kind = kind
                .parse::<DepKind>()
                .with_context(|| format!("bad dependency `{raw}`"))?;
            Ok((kind, key))
        }
        None => Ok((DepKind::Blocks, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: UpdateArgs,
    }

    #[test]
    fn update_args_parse_field_flags() {
        let w = Wrapper::parse_from([
            "test", "tr-a1", "--priority", "P1", "--status", "in_progress", "-l", "ui", "-l",
            "backend", "--remove-label", "stale", "--clear", "assignee",
        ]);
        assert_eq!(w.args.id, "tr-a1");
        assert_eq!(w.args.fields.priority, Some(Priority::new(1).unwrap()));
        assert_eq!(w.args.fields.status, Some(Status::InProgress));
        assert_eq!(w.args.fields.labels, ["ui", "backend"]);
        assert_eq!(w.args.remove_labels, ["stale"]);
        assert_eq!(w.args.clear, ["assignee"]);
    }

    #[test]
    fn bad_enum_values_are_rejected_by_clap() {
        assert!(Wrapper::try_parse_from(["test", "tr-a1", "--status", "done"]).is_err());
        assert!(Wrapper::try_parse_from(["test", "tr-a1", "--priority", "9"]).is_err());
    }

    #[test]
    fn dates_accept_day_or_timestamp() {
        let day = parse_when("2026-03-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        let precise = parse_when("2026-03-01T12:30:00.123456789+02:00").unwrap();
        assert_eq!(precise.to_rfc3339(), "2026-03-01T10:30:00.123456+00:00");
        assert!(parse_when("next tuesday").is_err());
    }

    #[test]
    fn extension_values_prefer_json() {
        assert_eq!(parse_extra("points=3").unwrap(), ("points".into(), json!(3)));
        assert_eq!(parse_extra("team=core").unwrap(), ("team".into(), json!("core")));
        assert_eq!(parse_extra("flag=true").unwrap().1, json!(true));
        assert!(parse_extra("novalue").is_err());
        assert!(parse_extra("=x").is_err());
    }

    #[test]
    fn dependency_kind_prefix_is_optional() {
        assert_eq!(parse_dep("tr-a1").unwrap(), (DepKind::Blocks, "tr-a1"));
        assert_eq!(parse_dep("related:tr-a1").unwrap(), (DepKind::Related, "tr-a1"));
        assert!(parse_dep("sibling:tr-a1").is_err());
    }
}
