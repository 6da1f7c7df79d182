//! イベントの送信先

use crate::event::Event;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::mpsc;

/// コントローラへの送信路
///
/// トラップしたスレッドから同期的に呼ばれます。
pub trait EventSink: Send + Sync {
    fn send(&self, event: Event);
}

/// 1行1イベントのJSONで書き出す
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn send(&self, event: Event) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            tracing::warn!("Failed to write {} event: {}", event.name(), e);
        }
    }
}

/// チャネルに送る（受信側が閉じていれば捨てる）
pub struct ChannelSink {
    sender: Mutex<mpsc::Sender<Event>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: Event) {
        let _ = self.sender.lock().send(event);
    }
}

/// すべて捨てる
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Reason;

    #[test]
    fn test_json_lines() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.send(Event::Resume);
        sink.send(Event::Release { tid: 3, reason: Reason::Watcher });

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec![r#"{"event":"resume"}"#, r#"{"event":"release","tid":3,"reason":1}"#]);
    }

    #[test]
    fn test_channel_sink() {
        let (sink, rx) = ChannelSink::new();
        sink.send(Event::Detached);
        assert_eq!(rx.recv().unwrap().name(), "detached");
        drop(rx);
        sink.send(Event::Detached);
    }
}
