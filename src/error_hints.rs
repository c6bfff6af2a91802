//! Error hints: mapping from error variants to user-facing remediation suggestions.
//!
//! Each error variant maps to:
//! - A 1-line summary (human readable)
//! - 0-2 actionable hints (commands, env vars, paths)
//! - Contextual fields that should be printed with the error
//!
//! Hints never suggest editing segment files by hand or deleting data.

use crate::error::Error;
use std::fmt::Write as _;

/// A remediation hint for an error.
#[derive(Debug, Clone)]
pub struct ErrorHint {
    /// Brief 1-line summary of the error category.
    pub summary: &'static str,
    /// Actionable hints for the user (0-2 items).
    pub hints: &'static [&'static str],
    /// Context fields that should be displayed with the error.
    pub context_fields: &'static [&'static str],
}

/// Get remediation hints for an error variant.
pub fn hints_for_error(error: &Error) -> ErrorHint {
    match error {
        Error::Config(msg) => config_hints(msg),
        Error::SchemaMismatch { .. } => ErrorHint {
            summary: "Datastore schema differs from the requested inputs/types",
            hints: &[
                "Open the datastore with empty inputs and types to adopt the stored schema",
                "Or record into a new datastore directory",
            ],
            context_fields: &["inputs", "stored_inputs"],
        },
        Error::DatastoreNotFound { .. } => ErrorHint {
            summary: "No datastore at this path",
            hints: &[
                "Check that the directory contains manifest.json",
                "Datastores are only created by writable opens",
            ],
            context_fields: &["path"],
        },
        Error::ReadOnly { .. } => ErrorHint {
            summary: "Datastore opened read-only",
            hints: &["Reopen without read-only to modify records"],
            context_fields: &["path"],
        },
        Error::Manifest(_) => ErrorHint {
            summary: "Datastore manifest is malformed",
            hints: &[
                "manifest.json must hold exactly five JSON lines",
                "Restore manifest.json from a backup of the datastore",
            ],
            context_fields: &["path", "line"],
        },
        Error::Segment(_) => ErrorHint {
            summary: "Segment manifest is malformed",
            hints: &[
                "Empty the .segment_manifest file to have it rebuilt from the segment",
            ],
            context_fields: &["path"],
        },
        Error::Serialization(msg) => serialization_hints(msg),
        Error::Validation(msg) => validation_hints(msg),
        Error::Io(err) => io_hints(err),
        Error::Json(err) => json_hints(err),
    }
}

fn config_hints(msg: &str) -> ErrorHint {
    if msg.contains("TUB_") {
        return ErrorHint {
            summary: "Invalid environment override",
            hints: &[
                "TUB_MAX_SEGMENT_LEN takes a positive integer",
                "TUB_READ_STRATEGY takes auto, mapped or buffered",
            ],
            context_fields: &["variable"],
        };
    }
    ErrorHint {
        summary: "Invalid or missing configuration file",
        hints: &[
            "Check that the file passed with --config or TUB_CONFIG_PATH is valid JSON",
            "Known keys: max_segment_len, read_strategy, metadata",
        ],
        context_fields: &["file_path"],
    }
}

fn serialization_hints(msg: &str) -> ErrorHint {
    if msg.contains("float") {
        return ErrorHint {
            summary: "Record contains NaN or infinity",
            hints: &["Replace non-finite values before writing the record"],
            context_fields: &["field"],
        };
    }
    ErrorHint {
        summary: "Record cannot be stored",
        hints: &["Records must serialize to a JSON object"],
        context_fields: &[],
    }
}

fn validation_hints(msg: &str) -> ErrorHint {
    if msg.contains("max_segment_len") {
        return ErrorHint {
            summary: "Invalid segment length",
            hints: &["Use a segment length of at least 1"],
            context_fields: &[],
        };
    }
    if msg.contains("closed") {
        return ErrorHint {
            summary: "Datastore already closed",
            hints: &["Open the datastore again"],
            context_fields: &["path"],
        };
    }
    ErrorHint {
        summary: "Validation failed",
        hints: &["Check the input values"],
        context_fields: &[],
    }
}

fn io_hints(err: &std::io::Error) -> ErrorHint {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorHint {
            summary: "File or directory not found",
            hints: &["Verify the datastore path and that no segment file was removed"],
            context_fields: &["path"],
        },
        std::io::ErrorKind::PermissionDenied => ErrorHint {
            summary: "Permission denied",
            hints: &["Check file/directory permissions"],
            context_fields: &["path"],
        },
        std::io::ErrorKind::InvalidData => ErrorHint {
            summary: "File contains invalid UTF-8",
            hints: &["The datastore may have been written by another tool"],
            context_fields: &["path"],
        },
        _ => ErrorHint {
            summary: "I/O error",
            hints: &["Check file system and permissions"],
            context_fields: &["path"],
        },
    }
}

fn json_hints(err: &serde_json::Error) -> ErrorHint {
    if err.is_syntax() || err.is_eof() {
        return ErrorHint {
            summary: "Invalid JSON syntax",
            hints: &["Check for missing commas, brackets, or quotes"],
            context_fields: &["line", "column"],
        };
    }
    if err.is_data() {
        return ErrorHint {
            summary: "JSON data does not match expected structure",
            hints: &["Check that JSON fields match expected schema"],
            context_fields: &["field_path"],
        };
    }
    ErrorHint {
        summary: "JSON error",
        hints: &["Verify JSON syntax and structure"],
        context_fields: &[],
    }
}

/// Format an error with its hints for display.
///
/// Returns a formatted string suitable for terminal output.
pub fn format_error_with_hints(error: &Error) -> String {
    let hint = hints_for_error(error);
    let mut output = String::new();

    let _ = writeln!(&mut output, "Error: {error}");

    // Summary if different from error message
    if !error.to_string().contains(hint.summary) {
        output.push('\n');
        output.push_str(hint.summary);
        output.push('\n');
    }

    if !hint.hints.is_empty() {
        output.push_str("\nSuggestions:\n");
        for &h in hint.hints {
            let _ = writeln!(&mut output, "  • {h}");
        }
    }

    output
}
