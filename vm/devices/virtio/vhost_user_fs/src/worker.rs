// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The slave worker, which owns command processing for one connection.

use crate::dispatcher::SlaveDispatcher;
use crate::protocol::SlaveMessage;
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::SlaveCommand;
use crate::SlaveError;
use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::executor::block_on;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A command sent to a [`SlaveWorker`].
#[derive(Debug)]
pub struct SlaveRequest {
    /// The command and its file descriptor.
    pub command: SlaveCommand,
    /// The encoded slave message.
    pub payload: Vec<u8>,
    /// Receives the command's status.
    pub response: oneshot::Sender<Result<(), SlaveError>>,
}

/// A handle for sending commands to a [`SlaveWorker`].
///
/// The worker runs until every client has been dropped.
#[derive(Debug, Clone)]
pub struct SlaveClient {
    send: mpsc::UnboundedSender<SlaveRequest>,
}

impl SlaveClient {
    /// Sends a command and waits for its status.
    pub async fn call(&self, command: SlaveCommand, payload: Vec<u8>) -> Result<(), SlaveError> {
        let (response, recv) = oneshot::channel();
        self.send
            .unbounded_send(SlaveRequest {
                command,
                payload,
                response,
            })
            .map_err(|_| SlaveError::Disconnected)?;
        recv.await.map_err(|_| SlaveError::Disconnected)?
    }

    /// Like [`Self::call`], but blocks the calling thread.
    pub fn call_blocking(&self, command: SlaveCommand, payload: Vec<u8>) -> Result<(), SlaveError> {
        block_on(self.call(command, payload))
    }
}

/// Decodes and applies slave commands one at a time.
///
/// When the last [`SlaveClient`] is dropped, which happens when the
/// connection to the backend is lost, the worker unmaps everything and exits.
#[derive(Debug)]
pub struct SlaveWorker {
    dispatcher: Option<Arc<SlaveDispatcher>>,
    recv: mpsc::UnboundedReceiver<SlaveRequest>,
}

impl SlaveWorker {
    /// Returns a new worker and its first client. With no dispatcher, every
    /// command fails with [`SlaveError::NoCacheWindow`].
    pub fn new(dispatcher: Option<Arc<SlaveDispatcher>>) -> (Self, SlaveClient) {
        let (send, recv) = mpsc::unbounded();
        (Self { dispatcher, recv }, SlaveClient { send })
    }

    /// Runs the worker on a new thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("vhost-user-fs-slave".into())
            .spawn(move || block_on(self.run()))
    }

    /// Processes commands until every client is gone, then releases all
    /// mappings.
    pub async fn run(mut self) {
        while let Some(req) = self.recv.next().await {
            let kind = req.command.kind();
            let result = self.handle(req.command, &req.payload);
            if let Err(err) = &result {
                tracing::warn!(
                    error = err as &dyn std::error::Error,
                    command = kind,
                    "slave command failed"
                );
            }
            // The client may have given up waiting.
            let _ = req.response.send(result);
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.reset();
        }
        tracing::info!("slave worker stopped");
    }

    fn handle(&self, command: SlaveCommand, payload: &[u8]) -> Result<(), SlaveError> {
        let dispatcher = self.dispatcher.as_ref().ok_or(SlaveError::NoCacheWindow)?;
        let message = if payload.len() == MAX_MESSAGE_SIZE {
            SlaveMessage::decode_max_framed(payload)?
        } else {
            SlaveMessage::decode(payload)?
        };
        dispatcher.dispatch(command, &message)
    }
}
