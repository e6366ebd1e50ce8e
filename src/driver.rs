use crate::channel::ControlChannel;
use crate::config::ChannelConfig;
use crate::packet::ControlPacket;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Abstraction for handing a finished packet to the transport, introduced to
///  facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet_buf: &[u8]);
}

/// Callback for payloads delivered in order by the receive window, i.e. the
///  upper (TLS record) layer's entry point.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: Bytes);
}

/// Event-loop glue around one [`ControlChannel`]: reacts to inbound packets,
///  dispatches in-order deliveries, and runs the retransmit timer.
///
/// Dropping the driver aborts the timer loop and discards the session's
///  reliability state - there is nothing to cancel cooperatively since no
///  operation blocks.
pub struct ChannelDriver {
    inner: Arc<Mutex<ControlChannel>>,
    sink: Arc<dyn PacketSink>,
    dispatcher: Arc<dyn MessageDispatcher>,
    active_handle: JoinHandle<()>,
}

/// The engine works on std instants; taking 'now' from tokio's clock keeps
///  timer behavior consistent with `start_paused` test time.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Drop for ChannelDriver {
    fn drop(&mut self) {
        self.active_handle.abort();
    }
}

impl ChannelDriver {
    pub fn new(
        config: Arc<ChannelConfig>,
        channel: ControlChannel,
        sink: Arc<dyn PacketSink>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ChannelDriver {
        let inner = Arc::new(Mutex::new(channel));
        let active_handle = tokio::spawn(Self::do_loop(config.clone(), inner.clone(), sink.clone()));

        ChannelDriver {
            inner,
            sink,
            dispatcher,
            active_handle,
        }
    }

    /// Queues a control message for reliable delivery and transmits it.
    ///  Returns false (without queueing) when the send window is full; the
    ///  caller retries once ACKs have freed a slot.
    pub async fn send_message(&self, message: &[u8]) -> anyhow::Result<bool> {
        let mut channel = self.inner.lock().await;
        match channel.send(now(), message)? {
            Some(packet) => {
                self.sink.send_packet(&packet).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Feeds one inbound packet through the engine. An error is a protocol
    ///  violation: the caller must tear the session down (drop the driver).
    pub async fn on_packet(&self, mut raw: Bytes) -> anyhow::Result<()> {
        let packet = ControlPacket::deser(&mut raw)?;
        trace!("inbound packet with {} ACKs", packet.acks.len());

        // the channel lock must not be held across the dispatcher callback:
        // a dispatcher that replies re-enters send_message on the same lock
        let (deliveries, packets) = {
            let mut channel = self.inner.lock().await;
            channel.on_packet(packet)?;

            let mut deliveries = Vec::new();
            while let Some(message) = channel.next_delivery() {
                deliveries.push(message);
            }
            // a dedicated ACK packet may be due now
            (deliveries, channel.outgoing(now()))
        };

        for message in deliveries {
            self.dispatcher.on_message(message).await;
        }
        for packet in packets {
            self.sink.send_packet(&packet).await;
        }
        Ok(())
    }

    /// Timer loop: wakes at the next retransmit deadline (or an idle poll
    ///  interval while nothing is pending) and flushes due packets.
    async fn do_loop(config: Arc<ChannelConfig>, inner: Arc<Mutex<ControlChannel>>, sink: Arc<dyn PacketSink>) {
        loop {
            let delay = {
                let channel = inner.lock().await;
                channel.until_wakeup(now())
                    .unwrap_or(config.initial_retransmit_timeout)
            };
            tokio::time::sleep(delay).await;

            let packets = {
                let mut channel = inner.lock().await;
                channel.outgoing(now())
            };
            if !packets.is_empty() {
                debug!("timer flush: {} packet(s) due", packets.len());
            }
            for packet in packets {
                sink.send_packet(&packet).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_id::MessageId;
    use crate::session_id::SessionId64;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> Arc<ChannelConfig> {
        Arc::new(ChannelConfig {
            window_span: 8,
            initial_retransmit_timeout: Duration::from_millis(100),
            max_retransmit_timeout: Duration::from_millis(400),
            max_frame_payload: 2048,
        })
    }

    fn session(tag: u8) -> SessionId64 {
        SessionId64::from_bytes(&[tag; 8]).unwrap()
    }

    fn counting_sink() -> (MockPacketSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let mut sink = MockPacketSink::new();
        let count_clone = count.clone();
        sink.expect_send_packet()
            .returning(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
        (sink, count)
    }

    fn driver(sink: MockPacketSink, dispatcher: MockMessageDispatcher) -> ChannelDriver {
        ChannelDriver::new(
            config(),
            ControlChannel::new(config(), session(1)).unwrap(),
            Arc::new(sink),
            Arc::new(dispatcher),
        )
    }

    fn ack_packet_for(id: u32) -> Bytes {
        let packet = ControlPacket {
            local_session: session(2),
            acks: vec![MessageId::from_raw(id)],
            remote_session: Some(session(1)),
            body: None,
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf).unwrap();
        buf.freeze()
    }

    fn data_packet(id: u32, payload: &'static [u8]) -> Bytes {
        let packet = ControlPacket {
            local_session: session(2),
            acks: vec![],
            remote_session: None,
            body: Some((MessageId::from_raw(id), Bytes::from_static(payload))),
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf).unwrap();
        buf.freeze()
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_retransmitted() {
        let (sink, sends) = counting_sink();
        let driver = driver(sink, MockMessageDispatcher::new());

        assert!(driver.send_message(b"handshake").await.unwrap());
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        // deadlines at ~100ms and ~300ms (doubled timeout) have passed
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sends.load(Ordering::SeqCst) >= 3);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_ack_stops_retransmission() {
        let (sink, sends) = counting_sink();
        let driver = driver(sink, MockMessageDispatcher::new());

        assert!(driver.send_message(b"handshake").await.unwrap());
        driver.on_packet(ack_packet_for(0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_inbound_data_is_dispatched_and_acked() {
        let (sink, sends) = counting_sink();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .withf(|message| message.as_ref() == b"payload")
            .once()
            .returning(|_| ());

        let driver = driver(sink, dispatcher);
        driver.on_packet(data_packet(0, b"payload")).await.unwrap();

        // the dedicated ACK packet went out
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_inbound_is_delivered_in_order() {
        let (sink, _sends) = counting_sink();
        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let delivered_clone = delivered.clone();

        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .returning(move |message| {
                delivered_clone.lock().unwrap().push(message.to_vec());
            });

        let driver = driver(sink, dispatcher);
        driver.on_packet(data_packet(1, b"second")).await.unwrap();
        driver.on_packet(data_packet(0, b"first")).await.unwrap();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.as_slice(), &[b"first".to_vec(), b"second".to_vec()]);
    }

    /// Dispatcher that answers each delivery by sending a message back
    ///  through the driver, like a handshake layer responding to its peer.
    struct ReplyingDispatcher {
        driver: std::sync::Mutex<Option<Arc<ChannelDriver>>>,
    }

    #[async_trait]
    impl MessageDispatcher for ReplyingDispatcher {
        async fn on_message(&self, _message: Bytes) {
            let driver = self.driver.lock().unwrap().take();
            if let Some(driver) = driver {
                assert!(driver.send_message(b"reply").await.unwrap());
            }
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_may_reply_via_send_message() {
        let (sink, sends) = counting_sink();
        let dispatcher = Arc::new(ReplyingDispatcher {
            driver: std::sync::Mutex::new(None),
        });

        let driver = Arc::new(ChannelDriver::new(
            config(),
            ControlChannel::new(config(), session(1)).unwrap(),
            Arc::new(sink),
            dispatcher.clone(),
        ));
        *dispatcher.driver.lock().unwrap() = Some(driver.clone());

        let deliver = driver.on_packet(data_packet(0, b"payload"));
        tokio::time::timeout(Duration::from_secs(60), deliver)
            .await
            .expect("dispatcher reply via send_message must not block on_packet")
            .unwrap();

        // the reply data packet and the dedicated ACK both went out
        assert!(sends.load(Ordering::SeqCst) >= 2);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_protocol_violation_surfaces() {
        let (sink, _) = counting_sink();
        let driver = driver(sink, MockMessageDispatcher::new());

        // peer acknowledges a message that was never sent
        assert!(driver.on_packet(ack_packet_for(5)).await.is_err());
    }
}
