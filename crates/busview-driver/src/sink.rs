//! 帧记录输出
//!
//! 每个输出由独立的投递线程驱动，从订阅队列取帧后写入 [`FrameSink`]。
//! 写入阻塞只影响该投递线程，接收线程不受影响。

use crate::hub::{HubEvent, ReceivedFrame, Subscription};
use crate::wire::WireFrame;
use std::io::{self, Write};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// CSV 表头
pub const CSV_HEADER: &str = "timestamp,id_hex,pgn,sa,data_hex,decoded_json";

pub trait FrameSink: Send {
    fn write(&mut self, frame: &ReceivedFrame) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// CSV 记录，每帧一行
///
/// 未解码的帧 `pgn`、`sa` 与 `decoded_json` 列为空。
pub struct CsvLogSink<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> CsvLogSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.out, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl<W: Write + Send> FrameSink for CsvLogSink<W> {
    fn write(&mut self, received: &ReceivedFrame) -> io::Result<()> {
        self.write_header()?;
        let frame = &received.frame;
        let (pgn, sa, decoded_json) = match &received.decoded {
            Some(decoded) => (
                decoded.pgn.to_string(),
                decoded.source_address.to_string(),
                serde_json::to_string(&decoded.fields).map_err(io::Error::other)?,
            ),
            None => (String::new(), String::new(), String::new()),
        };
        writeln!(
            self.out,
            "{:.6},{},{},{},{},{}",
            frame.timestamp(),
            frame.id_hex(),
            pgn,
            sa,
            frame.payload_hex(),
            csv_field(&decoded_json)
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        // 空记录也应是带表头的合法 CSV
        self.write_header()?;
        self.out.flush()
    }
}

/// JSON Lines 记录，每行一个 [`WireFrame`]
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> FrameSink for JsonLinesSink<W> {
    fn write(&mut self, received: &ReceivedFrame) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, &WireFrame::from(received))
            .map_err(io::Error::other)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// 启动投递线程，返回写入的帧数
///
/// 线程在收到流结束标记、订阅通道关闭或输出出错时退出，退出前刷新输出。
pub fn spawn_delivery(
    subscription: Subscription,
    mut sink: Box<dyn FrameSink>,
) -> JoinHandle<io::Result<u64>> {
    std::thread::spawn(move || {
        let mut written = 0u64;
        let result = loop {
            match subscription.recv() {
                Some(HubEvent::Frame(received)) => {
                    if let Err(e) = sink.write(&received) {
                        warn!("Sink write failed after {} frame(s): {}", written, e);
                        break Err(e);
                    }
                    written += 1;
                },
                Some(HubEvent::EndOfStream { reason }) => {
                    debug!("Delivery {} finished: {}", subscription.id(), reason);
                    break Ok(());
                },
                None => break Ok(()),
            }
        };
        let dropped = subscription.dropped();
        if dropped > 0 {
            warn!(
                "Delivery {} dropped {} frame(s) while the sink lagged",
                subscription.id(),
                dropped
            );
        }
        result.and(sink.flush()).map(|()| written)
    })
}
