use crate::pipeline::error::PipelineError;
use crate::pipeline::event::ParsedEvent;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;

// Destination for finished records.
pub trait EventSink: Send {
    fn emit(&mut self, event: &ParsedEvent) -> Result<(), PipelineError>;

    fn flush(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

impl EventSink for Box<dyn EventSink> {
    fn emit(&mut self, event: &ParsedEvent) -> Result<(), PipelineError> {
        (**self).emit(event)
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        (**self).flush()
    }
}

// One JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl JsonLinesSink<LineWriter<File>> {
    // Append to `path`, creating parent directories. Each record is flushed at its newline.
    pub fn append_to(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(LineWriter::new(file)))
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: &ParsedEvent) -> Result<(), PipelineError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        self.writer.flush()?;
        Ok(())
    }
}

// Hands each record to an in-process closure.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: FnMut(&ParsedEvent) + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventSink for CallbackSink<F>
where
    F: FnMut(&ParsedEvent) + Send,
{
    fn emit(&mut self, event: &ParsedEvent) -> Result<(), PipelineError> {
        (self.callback)(event);
        Ok(())
    }
}
