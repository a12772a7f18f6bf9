//! Routes decoded commands into the service and turns the outcome into
//! an acknowledgement plus a broker disposition for the inbound message.

use std::sync::Arc;

use futures::StreamExt;
use lapin::Consumer;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use tokio_util::sync::CancellationToken;

use crate::bus::{ACK_EXCHANGE, Bus};
use crate::messages::{Ack, AckCode, decode_command};
use crate::service::{InstanceService, ServiceError};

/// Where the inbound message ends up after the service has run. Poison
/// and foreign shared-queue traffic are acked-and-dropped before the
/// service is ever called.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Publish an ack with this code, then ack the inbound message.
    Ack(AckCode),
    /// Reject without requeue so the same poison does not loop.
    DeadLetter,
}

pub fn classify(result: &Result<(), ServiceError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack(AckCode::Ok),
        Err(ServiceError::NotFound(_)) => Disposition::Ack(AckCode::NotFound),
        Err(ServiceError::AlreadyExists(_)) => Disposition::Ack(AckCode::Conflict),
        Err(ServiceError::Internal(_)) => Disposition::Ack(AckCode::InternalError),
        Err(ServiceError::Unexpected(_)) => Disposition::DeadLetter,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// The durable control queue; every command is ours.
    Unique,
    /// The fan-out-bound replica queue; commands may target devices owned
    /// by another control plane.
    Shared,
}

pub struct Dispatcher {
    service: Arc<InstanceService>,
    bus: Arc<Bus>,
    ack_routing_key: String,
}

impl Dispatcher {
    pub fn new(service: Arc<InstanceService>, bus: Arc<Bus>, ack_routing_key: String) -> Self {
        Dispatcher {
            service,
            bus,
            ack_routing_key,
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut consumer: Consumer,
        kind: QueueKind,
        cancel: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = consumer.next() => delivery,
            };
            match delivery {
                Some(Ok(delivery)) => {
                    // Per-delivery task: a slow handler must not stall the
                    // consumer stream. Prefetch bounds the in-flight count.
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        dispatcher.handle_delivery(delivery, kind).await;
                    });
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "consumer stream error");
                }
                None => {
                    tracing::warn!(?kind, "consumer stream closed");
                    break;
                }
            }
        }
        tracing::info!(?kind, "consumer stopped");
    }

    async fn handle_delivery(&self, delivery: Delivery, kind: QueueKind) {
        let command = match decode_command(&delivery.data) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed command");
                ack_inbound(&delivery).await;
                return;
            }
        };
        tracing::info!(
            device_id = command.device_id,
            action = ?command.action,
            "processing command"
        );

        if kind == QueueKind::Shared {
            match self.service.owns_device(command.device_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        device_id = command.device_id,
                        "no container for device, discarding shared command"
                    );
                    ack_inbound(&delivery).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = ?e, "shared-queue filter failed");
                    reject_inbound(&delivery).await;
                    return;
                }
            }
        }

        let result = self
            .service
            .handle(
                command.action,
                command.device_id,
                command.device_stream_url.as_deref(),
            )
            .await;

        match classify(&result) {
            Disposition::Ack(code) => {
                let message = match &result {
                    Ok(()) => "OK".to_string(),
                    Err(e) => {
                        tracing::warn!(device_id = command.device_id, error = ?e, "command failed");
                        e.to_string()
                    }
                };
                let ack = Ack::new(command.device_id, command.action, code, message);
                if let Err(e) = self.bus.publish(ACK_EXCHANGE, &self.ack_routing_key, &ack).await {
                    // Leave the inbound unacked: the broker redelivers and
                    // the idempotent handler reproduces the same ack.
                    tracing::error!(error = ?e, "failed to publish ack");
                    return;
                }
                ack_inbound(&delivery).await;
            }
            Disposition::DeadLetter => {
                if let Err(ServiceError::Unexpected(e)) = &result {
                    tracing::error!(
                        device_id = command.device_id,
                        error = ?e,
                        "unexpected error, dead-lettering command"
                    );
                }
                reject_inbound(&delivery).await;
            }
        }
    }
}

async fn ack_inbound(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        tracing::error!(error = %e, "failed to ack delivery");
    }
}

async fn reject_inbound(delivery: &Delivery) {
    let options = BasicRejectOptions { requeue: false };
    if let Err(e) = delivery.reject(options).await {
        tracing::error!(error = %e, "failed to reject delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classifies_outcomes() {
        assert_eq!(classify(&Ok(())), Disposition::Ack(AckCode::Ok));
        assert_eq!(
            classify(&Err(ServiceError::NotFound(7))),
            Disposition::Ack(AckCode::NotFound)
        );
        assert_eq!(
            classify(&Err(ServiceError::AlreadyExists(7))),
            Disposition::Ack(AckCode::Conflict)
        );
        assert_eq!(
            classify(&Err(ServiceError::Internal(anyhow!("engine down")))),
            Disposition::Ack(AckCode::InternalError)
        );
        assert_eq!(
            classify(&Err(ServiceError::Unexpected(anyhow!("bug")))),
            Disposition::DeadLetter
        );
    }
}
