//! Interactive selection of a local model

use console::Term;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Select;

use common::error::{Error, Result};
use common::types::ModelIdentity;
use model_manager::Discovery;

/// One selectable model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub identity: ModelIdentity,
    pub label: String,
    /// The set still needs downloads before it can be deployed
    pub resumable: bool,
}

/// Complete models first, then the ones that can be finished
pub fn menu_entries(discovery: &Discovery) -> Vec<MenuEntry> {
    let ready = discovery.ready.iter().map(|set| MenuEntry {
        identity: set.identity.clone(),
        label: format!(
            "{} ({} weight file{})",
            set.identity,
            set.weight_files.len(),
            if set.weight_files.len() == 1 { "" } else { "s" }
        ),
        resumable: false,
    });

    let resumable = discovery.resumable.iter().map(|set| MenuEntry {
        identity: set.identity.clone(),
        label: format!("{} [incomplete: {}]", set.identity, set.reason),
        resumable: true,
    });

    ready.chain(resumable).collect()
}

/// Asks which model to deploy. `None` if there is nothing to choose from or
/// the user backs out.
pub fn select_model(discovery: &Discovery) -> Result<Option<MenuEntry>> {
    let entries = menu_entries(discovery);
    if entries.is_empty() {
        return Ok(None);
    }

    if !Term::stderr().is_term() {
        return Err(Error::InvalidArgument(
            "No terminal to show the model menu; pass <name> <author> <tag> to `run`".to_string(),
        ));
    }

    let labels: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a model to deploy")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(|e| Error::Internal(format!("Model menu failed: {}", e)))?;

    Ok(choice.map(|index| entries[index].clone()))
}
