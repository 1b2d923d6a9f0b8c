use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::{CommandId, Error, ParamId, Result};
use crate::network::{send_command, RequestBroker};
use crate::protocol::frame::{decode_table, decode_value, Frame, MAX_PAYLOAD_LEN, STATUS_OK};
use super::store::ParameterStore;

/// Get/Set access to the peer's parameters, mirrored into a local store
pub struct ParameterFacade<S> {
    broker: Arc<RequestBroker>,
    store: Arc<S>,
    excluded: Vec<ParamId>,
}

impl<S: ParameterStore> ParameterFacade<S> {
    /// Creates a facade over `broker` mirroring into `store`
    pub fn new(broker: Arc<RequestBroker>, store: Arc<S>) -> Self {
        ParameterFacade {
            broker,
            store,
            excluded: ParamId::BULK_EXCLUDED.to_vec(),
        }
    }

    /// Replaces the ids `get_all` leaves untouched
    pub fn with_excluded(mut self, excluded: Vec<ParamId>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Local parameter store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reads `id` from the peer and stores it locally
    pub async fn get_value(&self, id: ParamId, timeout: Duration) -> Result<i32> {
        let mut buf = [0u8; 4];
        let len = self.broker.send_and_wait(&Frame::get(id), &mut buf, timeout).await?;
        if len == 0 {
            return Err(Error::rejected(format!("peer has no parameter {}", id)));
        }
        let value = decode_value(&buf[..len])?;
        self.store.set(id, value)?;
        Ok(value)
    }

    /// Writes `id` on the peer, checking bounds locally first
    pub async fn set_value(&self, id: ParamId, value: i32, timeout: Duration) -> Result<()> {
        self.store.check(id, value)?;

        let mut status = [0u8; 1];
        let len = self
            .broker
            .send_and_wait(&Frame::set(id, value), &mut status, timeout)
            .await?;
        if len == 0 || status[0] != STATUS_OK {
            return Err(Error::rejected(format!("peer refused {} = {}", id, value)));
        }
        self.store.set(id, value)
    }

    /// Pushes `id` to the peer; the peer applies it without replying
    pub async fn set_value_without_response(&self, id: ParamId, value: i32) -> Result<()> {
        self.store.check(id, value)?;
        self.broker.send(&Frame::push(id, value)).await
    }

    /// Refreshes the local table from the peer in one round trip.
    ///
    /// Excluded ids are never overwritten. Returns the number of slots
    /// applied.
    pub async fn get_all(&self, timeout: Duration) -> Result<usize> {
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        let len = self.broker.send_and_wait(&Frame::get_all(), &mut buf, timeout).await?;

        let mut applied = 0;
        for (index, value) in decode_table(&buf[..len]).into_iter().enumerate() {
            let id = ParamId(index as u8);
            if self.excluded.contains(&id) || self.store.spec(id).is_none() {
                continue;
            }
            match self.store.set(id, value) {
                Ok(()) => applied += 1,
                Err(e) => warn!(%id, error = %e, "bulk value skipped"),
            }
        }
        debug!(applied, "parameter table refreshed");
        Ok(applied)
    }

    /// Sends the whole local table to the peer in one frame
    pub async fn set_all(&self, timeout: Duration) -> Result<()> {
        let frame = Frame::set_all(&self.store.table())?;
        let mut status = [0u8; 1];
        let len = self.broker.send_and_wait(&frame, &mut status, timeout).await?;
        if len == 0 || status[0] != STATUS_OK {
            return Err(Error::rejected("peer refused parameter table"));
        }
        Ok(())
    }

    /// Sends a command and waits for the peer's verdict
    pub async fn send_command(&self, command: CommandId, timeout: Duration) -> Result<()> {
        send_command(&self.broker, command, timeout).await
    }
}
