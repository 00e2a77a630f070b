//! Definitions Parser
//!
//! Loads step and resource definitions from YAML (JSON documents are
//! accepted too, being valid YAML). Structural checks happen later,
//! when the definitions are built into a graph.

use std::error::Error;
use std::fs;

use log::{debug, info, warn};

use super::model::Definitions;

/// Loads definitions from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the definitions file
///
/// # Returns
///
/// * `Ok(Definitions)` - Parsed, not yet validated definitions
/// * `Err` - Read or parse error
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::workflow::load_definitions;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let defs = load_definitions("run.yaml")?;
///     println!("Loaded {} steps", defs.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definitions(path: &str) -> Result<Definitions, Box<dyn Error>> {
    info!("Loading definitions from: {}", path);

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read definitions file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("Definitions loaded ({} bytes)", content.len());
    parse_definitions(&content)
}

/// Parses definitions from YAML text.
pub fn parse_definitions(content: &str) -> Result<Definitions, Box<dyn Error>> {
    let defs: Definitions = serde_yaml::from_str(content)
        .map_err(|e| format!("Failed to parse definitions: {}. Check the file format.", e))?;

    if defs.is_empty() {
        warn!("Definitions contain no steps or resources");
    }
    info!(
        "Parsed {} steps, {} resources",
        defs.steps.len(),
        defs.resources.len()
    );

    Ok(defs)
}
