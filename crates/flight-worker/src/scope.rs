//! Row writer handed to server components while they render.

use std::collections::HashMap;
use std::sync::Arc;

use flight_core::{
    encode_row, model_ref, module_ref, CallId, FlightError, ModuleReference, Row, RowId, WorkerEvent,
    ROOT_ROW,
};
use flight_manifest::EntryMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// Streams the rows of one render as chunk frames.
///
/// Row 0 is reserved for the root and written last; every other row goes
/// out as soon as it is produced.
#[derive(Debug)]
pub struct RenderScope {
    id: CallId,
    events: mpsc::Sender<WorkerEvent>,
    entries: Arc<EntryMap>,
    next_row: RowId,
    modules: HashMap<(String, String), RowId>,
    rows_written: usize,
}

impl RenderScope {
    pub(crate) fn new(id: CallId, events: mpsc::Sender<WorkerEvent>, entries: Arc<EntryMap>) -> Self {
        Self {
            id,
            events,
            entries,
            next_row: ROOT_ROW + 1,
            modules: HashMap::new(),
            rows_written: 0,
        }
    }

    /// Call this render belongs to.
    pub fn call_id(&self) -> CallId {
        self.id
    }

    /// Reference a client-boundary component by its server module id.
    ///
    /// Fails with an entry mapping error when the build produced no client
    /// asset for the module. Only this render fails.
    pub async fn client_reference(&mut self, module_id: &str, export: &str) -> Result<Value, FlightError> {
        let asset = self.entries.client_asset(module_id)?.to_string();

        let key = (asset.clone(), export.to_string());
        if let Some(row) = self.modules.get(&key) {
            return Ok(module_ref(*row));
        }

        let row = self.allocate_row()?;
        self.write(Row::module(
            row,
            ModuleReference {
                id: asset,
                chunks: Vec::new(),
                name: export.to_string(),
            },
        ))
        .await?;
        self.modules.insert(key, row);
        Ok(module_ref(row))
    }

    /// Stream a sub-tree now and return a reference to it.
    pub async fn emit(&mut self, value: Value) -> Result<Value, FlightError> {
        let row = self.allocate_row()?;
        self.write(Row::model(row, value)).await?;
        Ok(model_ref(row))
    }

    /// Rows written so far, root included.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub(crate) async fn write_root(&mut self, value: Value) -> Result<(), FlightError> {
        self.write(Row::model(ROOT_ROW, value)).await
    }

    fn allocate_row(&mut self) -> Result<RowId, FlightError> {
        let row = self.next_row;
        self.next_row = row
            .checked_add(1)
            .ok_or_else(|| FlightError::Protocol(format!("call {} ran out of row ids", self.id)))?;
        Ok(row)
    }

    async fn write(&mut self, row: Row) -> Result<(), FlightError> {
        let bytes = encode_row(&row)?;
        self.events
            .send(WorkerEvent::chunk(self.id, bytes))
            .await
            .map_err(|_| FlightError::ChannelClosed)?;
        self.rows_written += 1;
        Ok(())
    }
}
