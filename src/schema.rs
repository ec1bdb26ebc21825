// src/schema.rs

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Error;
use schemars::schema_for;

use crate::{
    flow::SessionSnapshot,
    graph::GraphDef,
    message::{InboundEvent, OutboundCommand},
};

/// Writes one JSON Schema per wire document into `out_dir` and returns the written paths.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("graph.schema.json", serde_json::to_string_pretty(&schema_for!(GraphDef))?),
        ("inbound-event.schema.json", serde_json::to_string_pretty(&schema_for!(InboundEvent))?),
        (
            "outbound-command.schema.json",
            serde_json::to_string_pretty(&schema_for!(OutboundCommand))?,
        ),
        (
            "session-snapshot.schema.json",
            serde_json::to_string_pretty(&schema_for!(SessionSnapshot))?,
        ),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, json) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, json)?;
        written.push(path);
    }
    Ok(written)
}
