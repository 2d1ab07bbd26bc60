//! Serial transport over `tokio-serial`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use tokio_serial::SerialStream;

use super::Transport;
use crate::config::SerialSettings;
use crate::error::{AppResult, DaqError};

/// Serial transport for RS-232/USB instruments
///
/// One exchange runs at a time: the stream sits behind an async mutex held
/// from the write until the reply delimiter (or the deadline). Unread input
/// is discarded before every command, so a reply that arrived after its
/// exchange gave up never answers the next one.
pub struct SerialTransport {
    /// Name used in log lines
    name: String,

    /// Port path, baud rate and reply framing
    settings: SerialSettings,

    /// The open stream, `None` until [`Transport::open`] succeeds
    #[cfg(feature = "instrument_serial")]
    port: Mutex<Option<SerialStream>>,
    #[cfg(not(feature = "instrument_serial"))]
    port: Mutex<Option<()>>,
}

impl SerialTransport {
    /// Create a closed transport.
    pub fn new(name: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            port: Mutex::new(None),
        }
    }

    /// Configured settings.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

/// A byte stream whose pending input can be thrown away.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
pub(crate) trait DiscardInput {
    /// Drop everything received but not yet read.
    fn discard_input(&mut self) -> AppResult<()>;
}

#[cfg(feature = "instrument_serial")]
impl DiscardInput for SerialStream {
    fn discard_input(&mut self) -> AppResult<()> {
        use tokio_serial::{ClearBuffer, SerialPort};

        self.clear(ClearBuffer::Input)
            .map_err(|e| DaqError::Transport(format!("clearing input failed: {}", e)))
    }
}

/// Strip trailing CR/LF from a received frame.
pub(crate) fn clean_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// One command/reply exchange on an open stream.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
pub(crate) async fn exchange<P>(
    port: &mut P,
    name: &str,
    command: &[u8],
    delimiter: &[u8],
    expect_response: bool,
    timeout: Duration,
) -> AppResult<Vec<String>>
where
    P: AsyncRead + AsyncWrite + DiscardInput + Unpin,
{
    port.discard_input()?;
    port.write_all(command)
        .await
        .map_err(|e| DaqError::Transport(format!("write failed: {}", e)))?;
    port.flush()
        .await
        .map_err(|e| DaqError::Transport(format!("flush failed: {}", e)))?;
    debug!("[{}] sent {:?}", name, String::from_utf8_lossy(command));

    if !expect_response {
        return Ok(Vec::new());
    }

    let read = async {
        let mut response: Vec<u8> = Vec::new();
        let mut buffer = [0u8; 64];
        loop {
            let n = port
                .read(&mut buffer)
                .await
                .map_err(|e| DaqError::Transport(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(DaqError::Transport("unexpected EOF".to_string()));
            }
            response.extend_from_slice(&buffer[..n]);
            if !delimiter.is_empty() && response.windows(delimiter.len()).any(|w| w == delimiter) {
                return Ok(response);
            }
        }
    };

    let response = tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| DaqError::TransportTimeout { timeout })??;
    let line = clean_line(&response);
    debug!("[{}] received {:?}", name, line);
    Ok(vec![line])
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            use tokio_serial::SerialPortBuilderExt;

            let stream = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| {
                    DaqError::Transport(format!(
                        "failed to open serial port '{}' at {} baud: {}",
                        self.settings.port, self.settings.baud_rate, e
                    ))
                })?;
            *self.port.lock().await = Some(stream);
            debug!(
                "[{}] serial port '{}' opened at {} baud",
                self.name, self.settings.port, self.settings.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::SerialFeatureDisabled)
        }
    }

    async fn send(
        &self,
        command: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> AppResult<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let mut guard = self.port.lock().await;
            let port = guard
                .as_mut()
                .ok_or_else(|| DaqError::Transport(format!("{} is not open", self.settings.port)))?;
            exchange(
                port,
                &self.name,
                command,
                self.settings.delimiter.as_bytes(),
                expect_response,
                timeout,
            )
            .await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (command, expect_response, timeout);
            Err(DaqError::SerialFeatureDisabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum::encode_reply;
    use futures::FutureExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    fn settings() -> SerialSettings {
        SerialSettings {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 230_400,
            delimiter: "^".to_string(),
            timeout_ms: 600,
        }
    }

    /// Host end of an in-memory line standing in for a serial port.
    struct Line(DuplexStream);

    impl AsyncRead for Line {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Line {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl DiscardInput for Line {
        fn discard_input(&mut self) -> AppResult<()> {
            let mut buffer = [0u8; 64];
            while let Some(Ok(n)) = self.0.read(&mut buffer).now_or_never() {
                if n == 0 {
                    break;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_serial_transport_creation() {
        let transport = SerialTransport::new("TEC HFVG", settings());
        assert_eq!(transport.name(), "TEC HFVG");
        assert_eq!(transport.settings().baud_rate, 230_400);
    }

    #[test]
    fn test_clean_line_keeps_frame_terminator() {
        assert_eq!(clean_line(b"*0929ee^"), "*0929ee^");
        assert_eq!(clean_line(b"<gp:12.5>\r\n"), "<gp:12.5>");
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = SerialTransport::new("TEC HFVG", settings());
        let result = transport
            .send(b"*6400002a\r", true, Duration::from_millis(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_late_echo_does_not_answer_next_query() {
        let (host, mut device) = duplex(256);
        let mut line = Line(host);
        // echo of a set-point write that arrived after the write gave up
        device.write_all(encode_reply(0x0929).as_bytes()).await.unwrap();

        let controller = tokio::spawn(async move {
            let mut buffer = [0u8; 16];
            let n = device.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"*01000021\r");
            device.write_all(encode_reply(0x0898).as_bytes()).await.unwrap();
            device
        });

        let lines = exchange(
            &mut line,
            "TEC HFVG",
            b"*01000021\r",
            b"^",
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(lines, vec![encode_reply(0x0898)]);
        controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let (host, mut device) = duplex(256);
        let mut line = Line(host);

        let lamp = tokio::spawn(async move {
            let mut buffer = [0u8; 16];
            device.read(&mut buffer).await.unwrap();
            device.write_all(b"<gp:1").await.unwrap();
            tokio::task::yield_now().await;
            device.write_all(b"2.5>\r\n").await.unwrap();
            device
        });

        let lines = exchange(
            &mut line,
            "Ozone A",
            b"<gp>",
            b"\r\n",
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(lines, vec!["<gp:12.5>".to_string()]);
        lamp.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (host, _device) = duplex(256);
        let mut line = Line(host);

        let timeout = Duration::from_millis(300);
        let result = exchange(&mut line, "Valves", b"$016\r", b"\r", true, timeout).await;

        assert!(matches!(result, Err(DaqError::TransportTimeout { .. })));
    }
}
