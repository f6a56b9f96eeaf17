//! `trl attic`: inspect and restore values that lost a merge.

use crate::output::{OutputMode, pretty_kv, pretty_section, render};
use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use std::io::{self, Write};
use trellis_core::Project;
use trellis_core::attic::AtticEntry;
use trellis_core::codec::record_value;

#[derive(Args, Debug)]
pub struct AtticArgs {
    #[command(subcommand)]
    pub command: AtticCommand,
}

#[derive(Subcommand, Debug)]
pub enum AtticCommand {
    /// List archived remnants, newest last.
    List {
        /// Only remnants of this issue (alias or id).
        #[arg(long)]
        record: Option<String>,
        /// Only remnants of this field; `record` for whole-record conflicts.
        #[arg(long)]
        field: Option<String>,
    },
    /// Show one remnant in full.
    Show {
        /// Attic key as printed by `trl attic list`.
        key: String,
    },
    /// Write an archived value back as a new version of its issue.
    Restore {
        /// Attic key as printed by `trl attic list`.
        key: String,
    },
}

fn short(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 40 {
        let cut: String = text.chars().take(39).collect();
        format!("{cut}…")
    } else {
        text
    }
}

fn write_entry(w: &mut dyn Write, entry: &AtticEntry) -> io::Result<()> {
    let r = &entry.remnant;
    pretty_section(w, &entry.key)?;
    pretty_kv(w, "record", r.record_id.as_str())?;
    pretty_kv(w, "field", &r.field)?;
    pretty_kv(w, "merged at", r.merged_at.to_rfc3339())?;
    pretty_kv(w, "lost", format!("{} (v{}, {:?})", r.lost_value, r.lost_version, r.lost_side))?;
    pretty_kv(w, "won", format!("{} (v{})", r.won_value, r.won_version))
}

/// Execute `trl attic <list|show|restore>`.
///
/// # Errors
///
/// Returns an error for an unknown record, field or key, or if a restore
/// cannot be written.
pub fn run_attic(args: &AtticArgs, project: &Project, output: OutputMode) -> Result<()> {
    match &args.command {
        AtticCommand::List { record, field } => {
            let entries = project.attic_list(record.as_deref(), field.as_deref())?;
            render(output, &entries, |list, w| {
                if list.is_empty() {
                    return writeln!(w, "Attic is empty.");
                }
                for entry in list {
                    writeln!(
                        w,
                        "{}  {:<12} lost {}",
                        entry.key,
                        entry.remnant.field,
                        short(&entry.remnant.lost_value)
                    )?;
                }
                Ok(())
            })
        }
        AtticCommand::Show { key } => {
            let entry = project.attic_show(key)?;
            render(output, &entry, |e, w| write_entry(w, e))
        }
        AtticCommand::Restore { key } => {
            let outcome = project.attic_restore(key)?;
            let fields: Vec<&str> = outcome.fields.iter().map(|f| f.name()).collect();
            let value = json!({
                "restored": key,
                "fields": fields,
                "displaced": outcome.displaced,
                "issue": record_value(&outcome.issue),
            });
            render(output, &value, |_, w| {
                if fields.is_empty() {
                    return writeln!(w, "{} already holds the archived value", outcome.issue.alias);
                }
                pretty_kv(w, "restored", format!("{} into {}", key, outcome.issue.alias))?;
                pretty_kv(w, "fields", fields.join(", "))?;
                if let Some(displaced) = &outcome.displaced {
                    pretty_kv(w, "displaced", format!("archived as {displaced}"))?;
                }
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: AtticArgs,
    }

    #[test]
    fn list_filters_are_optional() {
        let w = Wrapper::parse_from(["test", "list", "--field", "priority"]);
        match w.args.command {
            AtticCommand::List { record, field } => {
                assert!(record.is_none());
                assert_eq!(field.as_deref(), Some("priority"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_values_are_shortened() {
        assert_eq!(short(&json!(3)), "3");
        let long = short(&json!("x".repeat(80)));
        assert_eq!(long.chars().count(), 40);
        assert!(long.ends_with('…'));
    }
}
