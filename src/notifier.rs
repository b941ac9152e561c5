//! Status mirroring over the device websocket.
//!
//! The device pushes one `{model, data}` component per text message on
//! `ws://<host>/api/status`, the same representation the control api serves
//! as the initial snapshot. Incoming deltas are reduced into a cached
//! [`Status`] behind a watch channel, so readers always observe a
//! consistent snapshot without locks.

use crate::{
    error::NotifierError,
    status::{parse_component, Component, Status},
};
use futures::{pin_mut, select, FutureExt, StreamExt};
use http::uri::Authority;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub enum NotifierEvent {
    Component(Component),
    /// Terminal event, the feed disconnected. Reconnecting is the caller's
    /// decision, the cached status keeps its last snapshot.
    Closed,
}

#[derive(Debug)]
pub struct Notifier {
    host: Authority,

    status_sender: watch::Sender<Arc<Status>>,
    status_receiver: watch::Receiver<Arc<Status>>,

    event_sender: broadcast::Sender<NotifierEvent>,
}
impl Notifier {
    pub fn new(
        host: Authority,
        initial: Status,
    ) -> Self {
        let (status_sender, status_receiver) = watch::channel(Arc::new(initial));

        let (event_sender, _) = broadcast::channel(EVENT_QUEUE_DEPTH);

        Self {
            host,

            status_sender,
            status_receiver,

            event_sender,
        }
    }

    /// Watch side of the cached status.
    pub fn status(&self) -> watch::Receiver<Arc<Status>> {
        self.status_receiver.clone()
    }
    pub fn status_snapshot(&self) -> Arc<Status> {
        self.status_receiver.borrow().clone()
    }
    /// Replaces the whole cached status, used when (re)fetching the full
    /// snapshot over http.
    pub fn status_set(
        &self,
        status: Status,
    ) {
        self.status_sender.send(Arc::new(status)).unwrap();
    }

    /// Per-component feed. Slow subscribers lose oldest events.
    pub fn events(&self) -> broadcast::Receiver<NotifierEvent> {
        self.event_sender.subscribe()
    }

    fn message_handle(
        &self,
        text: &str,
    ) {
        let wire = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(wire) => wire,
            Err(error) => {
                log::warn!("{}: dropping unparsable status message: {error}", self.host);
                return;
            }
        };

        let component = match parse_component(&wire) {
            Ok(component) => component,
            Err(error) => {
                log::warn!("{}: dropping status component: {error}", self.host);
                return;
            }
        };

        let mut status = (*self.status_receiver.borrow().clone()).clone();
        status.apply(component.clone());
        self.status_sender.send(Arc::new(status)).unwrap();

        let _ = self.event_sender.send(NotifierEvent::Component(component));
    }

    /// Connects and mirrors deltas until the peer disconnects or the exit
    /// token fires. Ends with a terminal [`NotifierEvent::Closed`] in the
    /// event feed when the peer closed the connection.
    pub async fn run(
        &self,
        exit: CancellationToken,
    ) -> Result<(), NotifierError> {
        let url = format!("ws://{}/api/status", self.host);
        let (web_socket, _response) = connect_async(url).await?;
        let mut web_socket = web_socket.fuse();

        let exit_flag = exit.cancelled().fuse();
        pin_mut!(exit_flag);

        loop {
            select! {
                () = exit_flag => {
                    break Ok(());
                }
                message = web_socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.message_handle(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = self.event_sender.send(NotifierEvent::Closed);
                        break Ok(());
                    }
                    Some(Ok(_)) => {
                        // ping/pong/binary, nothing to mirror
                    }
                    Some(Err(error)) => {
                        let _ = self.event_sender.send(NotifierEvent::Closed);
                        break Err(error.into());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests_notifier {
    use super::{Notifier, NotifierEvent};
    use crate::status::Status;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use tokio_util::sync::CancellationToken;

    fn phone_wire(battery_level: u8) -> String {
        serde_json::json!({
            "model": "Phone",
            "data": {
                "device_id": "1ab2",
                "device_name": "Phone",
                "battery_level": battery_level,
                "battery_state": "OK",
                "ip": "127.0.0.1",
                "memory": 1024,
                "memory_state": "OK",
                "time_echo_port": 12321,
            },
        })
        .to_string()
    }

    #[tokio::test]
    async fn mirrors_deltas_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut web_socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            web_socket
                .send(Message::Text(phone_wire(80)))
                .await
                .unwrap();
            web_socket
                .send(Message::Text(phone_wire(79)))
                .await
                .unwrap();
            web_socket.send(Message::Close(None)).await.unwrap();
            let _ = web_socket.close(None).await;
        });

        let notifier = Notifier::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            Status::default(),
        );
        let status = notifier.status();
        let mut events = notifier.events();

        notifier.run(CancellationToken::new()).await.unwrap();
        server.await.unwrap();

        // both deltas mirrored, battery ends at the last pushed value
        assert_eq!(
            status.borrow().phone.as_ref().unwrap().battery_level_percent,
            79
        );
        assert!(status.has_changed().unwrap());

        let mut battery_levels = Vec::new();
        loop {
            match events.try_recv() {
                Ok(NotifierEvent::Component(component)) => {
                    if let crate::status::Component::Phone(phone) = component {
                        battery_levels.push(phone.battery_level_percent);
                    }
                }
                Ok(NotifierEvent::Closed) => break,
                Err(error) => panic!("event feed ended without Closed: {error:?}"),
            }
        }
        assert_eq!(battery_levels, vec![80, 79]);
    }

    #[tokio::test]
    async fn unknown_component_dropped_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut web_socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            let unknown = serde_json::json!({"model": "Thermometer", "data": {}}).to_string();
            web_socket.send(Message::Text(unknown)).await.unwrap();
            web_socket
                .send(Message::Text(phone_wire(55)))
                .await
                .unwrap();
            let _ = web_socket.close(None).await;
        });

        let notifier = Notifier::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            Status::default(),
        );
        let status = notifier.status();

        notifier.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            status.borrow().phone.as_ref().unwrap().battery_level_percent,
            55
        );
    }
}
