use super::BridgeError;
use tokio::sync::mpsc;

/// Messages buffered per direction before `post` waits.
const PORT_CAPACITY: usize = 256;

/// A message as delivered: the origin is stamped by the sending port, never
/// taken from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMessage {
    pub origin: String,
    pub data: String,
}

/// One end of a duplex message channel.
pub struct MessagePort {
    sender: PortSender,
    receiver: mpsc::Receiver<PortMessage>,
}

/// Creates two entangled ports. Messages posted on the first arrive at the
/// second stamped with `first_origin`, and vice versa.
pub fn channel(first_origin: &str, second_origin: &str) -> (MessagePort, MessagePort) {
    let (to_second, second_rx) = mpsc::channel(PORT_CAPACITY);
    let (to_first, first_rx) = mpsc::channel(PORT_CAPACITY);
    (
        MessagePort {
            sender: PortSender {
                origin: first_origin.to_string(),
                tx: to_second,
            },
            receiver: first_rx,
        },
        MessagePort {
            sender: PortSender {
                origin: second_origin.to_string(),
                tx: to_first,
            },
            receiver: second_rx,
        },
    )
}

impl MessagePort {
    /// The origin this port stamps on outgoing messages.
    pub fn origin(&self) -> &str {
        &self.sender.origin
    }

    pub fn split(self) -> (PortSender, mpsc::Receiver<PortMessage>) {
        (self.sender, self.receiver)
    }
}

#[derive(Debug, Clone)]
pub struct PortSender {
    origin: String,
    tx: mpsc::Sender<PortMessage>,
}

impl PortSender {
    pub async fn post(&self, data: String) -> Result<(), BridgeError> {
        self.tx
            .send(PortMessage {
                origin: self.origin.clone(),
                data,
            })
            .await
            .map_err(|_| BridgeError::Closed)
    }
}
