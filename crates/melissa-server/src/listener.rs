//! TCP data-plane listener
//!
//! Simulations connect here and send length-prefixed frames. A frame shorter
//! than the fixed data header is a control message: the only one expected is
//! CONNECTION-REQUEST, answered on the same socket with CONNECTION-RESPONSE.
//! Every other frame is a [`DataMessage`] forwarded into the bounded queue.

use melissa_core::{
    ConnectionInfo, DataMessage, DataSender, FIELD_NAME_WIDTH, Message, frame_stream, write_frame,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct DataListener {
    listener: TcpListener,
    info: Arc<ConnectionInfo>,
    sender: DataSender,
}

impl DataListener {
    pub fn new(listener: TcpListener, info: ConnectionInfo, sender: DataSender) -> Self {
        Self {
            listener,
            info: Arc::new(info),
            sender,
        }
    }

    /// Accept simulations until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Ok(addr) = self.listener.local_addr() {
                info!(addr = %addr, "Data plane listening");
            }
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Simulation connected");
                        let info = self.info.clone();
                        let sender = self.sender.clone();
                        tokio::spawn(serve_connection(stream, info, sender));
                    }
                    Err(e) => warn!(error = %e, "Data plane accept failed"),
                }
            }
        })
    }
}

async fn serve_connection(stream: TcpStream, info: Arc<ConnectionInfo>, sender: DataSender) {
    let (read_half, mut write_half) = stream.into_split();
    let frames = frame_stream(read_half);
    futures::pin_mut!(frames);

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Data plane read failed");
                break;
            }
        };

        if frame.len() < FIELD_NAME_WIDTH {
            match Message::decode(&frame) {
                Ok(Message::ConnectionRequest {
                    simulation_id,
                    comm_size,
                }) => {
                    debug!(simulation_id = %simulation_id, comm_size, "Connection request");
                    let response = Message::ConnectionResponse(info.as_ref().clone()).encode();
                    if let Err(e) = write_frame(&mut write_half, &response).await {
                        warn!(error = %e, "Failed to answer connection request");
                        break;
                    }
                }
                Ok(other) => debug!(kind = other.kind(), "Ignoring control message on data plane"),
                Err(e) => warn!(error = %e, "Discarding malformed control frame"),
            }
            continue;
        }

        match DataMessage::decode(&frame) {
            Ok(message) => {
                sender.push(message);
            }
            Err(e) => warn!(error = %e, bytes = frame.len(), "Discarding malformed data frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use melissa_core::{SimulationId, data_plane};
    use std::time::Duration;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            comm_size: 1,
            sobol: true,
            learning: false,
            nb_parameters: 3,
            verbosity: 1,
            data_endpoints: vec!["127.0.0.1:7000".into()],
        }
    }

    #[tokio::test]
    async fn test_handshake_then_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sender, mut receiver) = data_plane(8);
        let handle = DataListener::new(listener, info(), sender).spawn();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let request = Message::ConnectionRequest {
            simulation_id: SimulationId(5),
            comm_size: 4,
        };
        write_frame(&mut write_half, &request.encode()).await.unwrap();

        let responses = frame_stream(read_half);
        futures::pin_mut!(responses);
        let frame = responses.next().await.unwrap().unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::ConnectionResponse(info()));

        let data = DataMessage::new(SimulationId(5), "temperature", 3, vec![1.5, 2.5]);
        write_frame(&mut write_half, &data.encode().unwrap()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(data));
        handle.abort();
    }
}
