//! Installation through the privileged item copy service.

use super::{decode_input, optional_str, require_str, Processor, ProcessorFailure, VariableSpec};
use crate::core::types::{Environment, Value};
use crate::daemon::protocol::send_request;
use crate::daemon::validate::{CopyItem, ItemCopyRequest};
use crate::daemon::DEFAULT_INSTALLER_SOCKET;
use indexmap::IndexMap;
use std::path::Path;

/// Environment key holding the install service socket.
pub const SOCKET_KEY: &str = "INSTALLER_SOCKET";

/// Copies items from a mounted image into place.
#[derive(Debug, Default)]
pub struct ItemCopier;

const INPUTS: &[VariableSpec] = &[
    VariableSpec::required("mount_point", "Mounted volume the items are copied from."),
    VariableSpec::required(
        "items_to_copy",
        "List of mappings with source_item, destination_path and optional \
         destination_item, user, group, mode.",
    ),
    VariableSpec::with_default(SOCKET_KEY, DEFAULT_INSTALLER_SOCKET, "Install service socket."),
];

const OUTPUTS: &[VariableSpec] = &[VariableSpec::optional(
    "item_copier_summary_result",
    "Description of the copied items.",
)];

impl Processor for ItemCopier {
    fn name(&self) -> &str {
        "ItemCopier"
    }

    fn description(&self) -> &str {
        "Copy items from a mounted volume through the privileged install service."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        OUTPUTS
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let req = ItemCopyRequest {
            mount_point: require_str(env, "mount_point")?,
            items_to_copy: decode_input::<Vec<CopyItem>>(env, "items_to_copy")?,
        };
        let socket =
            optional_str(env, SOCKET_KEY).unwrap_or_else(|| DEFAULT_INSTALLER_SOCKET.to_string());
        let payload = send_request(Path::new(&socket), &req, None).map_err(|e| {
            ProcessorFailure::new(format!("item copy from {} failed", req.mount_point))
                .with_detail(e.to_string())
        })?;
        let copied: Vec<String> = serde_json::from_str(&payload).map_err(|e| {
            ProcessorFailure::new(format!("unexpected install service reply: {}", e))
        })?;
        for path in &copied {
            tracing::info!("copied {}", path);
        }

        let mut data = IndexMap::new();
        data.insert(
            "copied_items".to_string(),
            Value::List(copied.into_iter().map(Value::String).collect()),
        );
        let mut summary = IndexMap::new();
        summary.insert(
            "summary_text".to_string(),
            Value::from("The following items were copied:"),
        );
        summary.insert("data".to_string(), Value::Map(data));
        env.insert("item_copier_summary_result", summary);
        Ok(())
    }
}
