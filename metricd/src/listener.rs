use anyhow::{Context, Result};
use async_std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use metricd_core::debug::DEBUG;
use metricd_core::error::debug_error;
use metricd_core::parser;
use metricd_storage::MetricService;

/// The largest payload a UDP datagram can carry over IPv4
const MAX_DATAGRAM_LEN: usize = 65_507;

/// Receives StatsD datagrams and forwards every well-formed record to the service.
///
/// The listener never touches storage itself and never sends a reply.
pub struct StatsdListener {
    socket: UdpSocket,
    service: MetricService,
    verbose: bool,
}

impl StatsdListener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        service: MetricService,
        verbose: bool,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .context("binding the statsd listener")?;
        Ok(StatsdListener {
            socket,
            service,
            verbose,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives datagrams until the task running it is cancelled
    pub async fn run(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, _peer)) => {
                    self.handle_datagram(&buf[..len]).await;
                }
                Err(err) => debug_error(anyhow::Error::from(err).context("receiving datagram")),
            }
        }
    }

    /// Parses one datagram and submits its records, returning `(accepted, malformed)`
    pub async fn handle_datagram(&self, datagram: &[u8]) -> (usize, usize) {
        DEBUG.datagram_received();
        let input = match std::str::from_utf8(datagram) {
            Ok(input) => input,
            Err(err) => {
                DEBUG.records_malformed(1);
                debug_error(anyhow::Error::from(err).context("datagram is not valid utf-8"));
                return (0, 1);
            }
        };

        let parsed = parser::parse(input);
        let accepted = parsed.records.len();
        let malformed = parsed.errors.len();
        for err in parsed.errors {
            debug_error(anyhow::Error::from(err).context("dropped malformed record"));
        }
        for record in parsed.records {
            if self.verbose {
                tracing::debug!(
                    key = record.key,
                    value = record.value,
                    metric_type = %record.type_,
                    labels = ?record.labels,
                    "received sample"
                );
            }
            self.service
                .insert_sample(record.key, record.value, record.owned_labels())
                .await;
        }
        DEBUG.records_accepted(accepted);
        DEBUG.records_malformed(malformed);
        (accepted, malformed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use metricd_core::TimeRange;
    use std::time::Duration;

    async fn listener() -> StatsdListener {
        let service = MetricService::with_in_memory_backend().unwrap();
        StatsdListener::bind("127.0.0.1:0", service, true)
            .await
            .unwrap()
    }

    #[async_std::test]
    async fn skips_malformed_records() {
        let listener = listener().await;
        let counts = listener.handle_datagram(b"a:1|c\ngarbage\nb:2|c").await;
        assert_eq!(counts, (2, 1));
        listener.service.flush().await;

        let keys = listener.service.list_metrics().into_iter().collect::<Vec<_>>();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        let a = listener.service.query("a", TimeRange::all()).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].value(), 1.0);
    }

    #[async_std::test]
    async fn stores_labels_and_rejects_binary() {
        let listener = listener().await;
        let counts = listener
            .handle_datagram(b"http.latency:12.5|ms|@0.5,host=web-1,dc=eu; :1|c")
            .await;
        assert_eq!(counts, (1, 1));
        assert_eq!(listener.handle_datagram(&[0xff, 0xfe, b':']).await, (0, 1));
        listener.service.flush().await;

        let samples = listener
            .service
            .query("http.latency", TimeRange::all())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value(), 12.5);
        assert_eq!(
            samples[0].labels(),
            &[
                ("host".to_string(), "web-1".to_string()),
                ("dc".to_string(), "eu".to_string())
            ][..]
        );
    }

    #[async_std::test]
    async fn receives_datagrams_over_udp() {
        let listener = listener().await;
        let addr = listener.local_addr().unwrap();
        let service = listener.service.clone();
        let task = async_std::task::spawn(async move { listener.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"a:1|c\ngarbage\nb:2|c", addr).await.unwrap();

        let mut stored = 0;
        for _ in 0..100 {
            service.flush().await;
            stored = service.list_metrics().len();
            if stored == 2 {
                break;
            }
            async_std::task::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stored, 2);
        task.cancel().await;
    }
}
