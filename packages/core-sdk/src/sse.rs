//! Incremental decoding of `text/event-stream` response bodies.
//!
//! Bytes arrive in arbitrary chunks: a chunk may end in the middle of a
//! UTF-8 sequence, a line, or a frame. [`Utf8Decoder`] holds back incomplete
//! code points and [`EventParser`] holds back incomplete lines and frames, so
//! the dispatched events never depend on where the chunk boundaries fell.

/**
 * \brief 增量 UTF-8 解码器：跨块保留未完成的多字节序列。
 */
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 解码一个字节块，返回已完整的文本；末尾不完整的序列留待下一块。
     * \details 非法字节替换为 U+FFFD，与浏览器 TextDecoder 的非严格模式一致。
     */
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /**
     * \brief 流结束时冲刷残留字节；残缺序列输出为 U+FFFD。
     */
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/**
 * \brief 一个完整的 SSE 帧；`event:` 与 `id:` 字段不影响分发，不予保留。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /** \brief 多行 `data:` 以 `\n` 拼接后的内容 */
    pub data: String,
}

/**
 * \brief SSE 帧解析器：缓冲半行与半帧，遇到空行时分发一帧。
 */
#[derive(Debug, Default)]
pub struct EventParser {
    line: String,
    after_cr: bool,
    started: bool,
    data: String,
    has_data: bool,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 输入一段已解码文本，按到达顺序返回其中完成的帧。
     */
    pub fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut text = text;
        if !self.started {
            if text.is_empty() {
                return events;
            }
            self.started = true;
            text = text.strip_prefix('\u{feff}').unwrap_or(text);
        }
        for ch in text.chars() {
            if self.after_cr {
                self.after_cr = false;
                if ch == '\n' {
                    continue;
                }
            }
            match ch {
                '\r' => {
                    self.after_cr = true;
                    self.end_line(&mut events);
                }
                '\n' => self.end_line(&mut events),
                _ => self.line.push(ch),
            }
        }
        events
    }

    /**
     * \brief 流结束：处理未换行的最后一行，并分发尚未以空行结束的帧。
     */
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.line.is_empty() {
            let mut sink = Vec::new();
            self.end_line(&mut sink);
        }
        self.dispatch()
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            // event、id、retry 与未知字段忽略
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseEvent {
            data: std::mem::take(&mut self.data),
        })
    }
}
