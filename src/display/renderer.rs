use std::io::{self, IsTerminal, Write};

use crossterm::queue;
use crossterm::style::{ContentStyle, Print};

use super::theme;
use super::tool_format::truncate_width;
use crate::event::{Event, Question, RunSummary};
use crate::ralph::{LoopOutput, LoopSnapshot, OutputSink};

/// Writes run and loop output to a terminal, colored when the writer is one.
pub struct Renderer<W: Write = io::Stdout> {
    out: W,
    color: bool,
    /// Width used to truncate tool lines.
    width: usize,
    /// Whether streamed text left the cursor mid-line.
    text_streaming: bool,
}

impl Default for Renderer<io::Stdout> {
    fn default() -> Self {
        let out = io::stdout();
        let color = out.is_terminal();
        Self {
            out,
            color,
            width: super::term_width(),
            text_streaming: false,
        }
    }
}

impl Renderer<io::Stdout> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W: Write> Renderer<W> {
    /// A renderer without colors, for captured output.
    pub fn with_writer(writer: W) -> Self {
        Self {
            out: writer,
            color: false,
            width: 80,
            text_streaming: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render_event(&mut self, event: &Event) {
        match event {
            Event::SessionId(id) => {
                self.end_text();
                self.line(theme::dim(), &format!("Session {id}"));
            }
            Event::Text(text) => self.stream_text(text),
            Event::Tool(description) => {
                self.end_text();
                let line = truncate_width(description, self.width);
                self.line(theme::tool_name(), &line);
            }
            Event::Question(question) => self.render_question(question),
            Event::Result(summary) => self.render_result(summary),
            Event::Error(failure) => {
                self.end_text();
                self.line(theme::error(), &format!("Error: {}", failure.message));
            }
        }
        self.out.flush().ok();
    }

    pub fn render_loop_output(&mut self, output: &LoopOutput) {
        match output {
            LoopOutput::IterationStarted {
                iteration,
                max_iterations,
            } => {
                self.end_text();
                let budget = if *max_iterations == 0 {
                    String::new()
                } else {
                    format!("/{max_iterations}")
                };
                self.line(
                    theme::iteration_header(),
                    &format!("── Ralph iteration {iteration}{budget} ──"),
                );
            }
            LoopOutput::Event(event) => self.render_event(event),
            LoopOutput::IterationFinished { iteration, summary } => {
                self.end_text();
                self.line(
                    theme::dim(),
                    &format!("iteration {iteration} {}", summary.summary_line()),
                );
            }
            LoopOutput::Finished(snapshot) => self.render_loop_status(snapshot),
        }
        self.out.flush().ok();
    }

    pub fn render_loop_status(&mut self, snapshot: &LoopSnapshot) {
        self.end_text();
        for line in snapshot.status_line().lines() {
            self.line(ContentStyle::default(), line);
        }
        if let Some(error) = &snapshot.last_error {
            self.line(theme::error(), &format!("Last error: {error}"));
        }
        self.out.flush().ok();
    }

    fn render_question(&mut self, question: &Question) {
        self.end_text();
        for item in &question.items {
            let heading = if item.header.is_empty() {
                item.prompt.clone()
            } else {
                format!("{}: {}", item.header, item.prompt)
            };
            self.line(theme::question(), &format!("? {heading}"));
            for (i, option) in item.options.iter().enumerate() {
                let text = if option.description.is_empty() {
                    format!("  {}. {}", i + 1, option.label)
                } else {
                    format!("  {}. {} - {}", i + 1, option.label, option.description)
                };
                self.line(theme::dim(), &text);
            }
        }
    }

    fn render_result(&mut self, summary: &RunSummary) {
        self.end_text();
        self.write(theme::result_line(), "Done ");
        self.line(theme::dim(), &summary.summary_line());
    }

    fn stream_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        queue!(self.out, Print(text)).ok();
        self.text_streaming = !text.ends_with('\n');
    }

    fn end_text(&mut self) {
        if self.text_streaming {
            queue!(self.out, Print("\n")).ok();
            self.text_streaming = false;
        }
    }

    fn write(&mut self, style: ContentStyle, text: &str) {
        if self.color {
            queue!(self.out, Print(style.apply(text))).ok();
        } else {
            queue!(self.out, Print(text)).ok();
        }
    }

    fn line(&mut self, style: ContentStyle, text: &str) {
        self.write(style, text);
        queue!(self.out, Print("\n")).ok();
    }
}

impl<W: Write> OutputSink for Renderer<W> {
    fn deliver(&mut self, output: LoopOutput) {
        self.render_loop_output(&output);
    }
}
