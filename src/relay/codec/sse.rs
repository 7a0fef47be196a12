//! # SSE 事件分帧
//!
//! 将上游字节流切成事件；事件边界是空行，`data:` 多行按换行拼接。

/// 一个已分帧的 SSE 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` 字段；OpenAI 系列通常缺省
    pub event: Option<String>,
    /// `data:` 字段内容（多行已拼接）
    pub data: String,
}

impl SseEvent {
    #[must_use]
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// OpenAI 流结束哨兵
    #[must_use]
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// 增量 SSE 解析器；跨 chunk 维护未完结的事件缓冲
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一个网络 chunk，返回其中完结的事件
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some((boundary, skip)) = find_event_boundary(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..boundary + skip).collect();
            let raw = &raw[..boundary];
            if let Some(event) = parse_event_block(raw) {
                events.push(event);
            }
        }
        events
    }

    /// 流结束时冲出缓冲区残留
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        parse_event_block(&rest)
    }
}

/// 事件边界：`\n\n` 或 `\r\n\r\n`，取先出现者
fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some((a, s1)), Some((b, s2))) => {
            if a < b {
                Some((a, s1))
            } else {
                Some((b, s2))
            }
        }
        (some, None) => some,
        (None, some) => some,
    }
}

fn parse_event_block(raw: &str) -> Option<SseEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        }
        // id: / retry: / 注释行不参与中继
    }

    if data_lines.is_empty() && event_name.is_none() {
        return None;
    }
    Some(SseEvent {
        event: event_name,
        data: data_lines.join("\n"),
    })
}

/// 以客户端方言输出一条 SSE 事件
#[must_use]
pub fn format_event(event: Option<&str>, data: &str) -> String {
    match event {
        Some(name) => format!("event: {name}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events_across_chunks() {
        let mut parser = SseParser::new();
        let first = parser.feed("data: {\"a\":");
        assert!(first.is_empty());

        let second = parser.feed("1}\n\ndata: [DONE]\n\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].data, "{\"a\":1}");
        assert!(second[1].is_done_sentinel());
    }

    #[test]
    fn parses_event_field() {
        let mut parser = SseParser::new();
        let events =
            parser.feed("event: content_block_delta\ndata: {\"index\":0}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"index\":0}");
    }

    #[test]
    fn handles_crlf_boundaries() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: tail").is_empty());
        let tail = parser.finish().unwrap();
        assert_eq!(tail.data, "tail");
        assert!(parser.finish().is_none());
    }
}
