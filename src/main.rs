// src/main.rs
//
// reformaxml — streaming XML re-indenter
//
// - One forward pass, no DOM: a chunked lexer presents the input as a
//   character stream with one-byte lookahead, and the formatter lexes one
//   tag per iteration and re-emits it on its own indented line (two spaces
//   per nesting level).
// - <tag></tag> pairs with nothing between them are fused into <tag/>. The
//   open-tag line is held back one iteration to make that possible.
// - Leaf elements with inline text render as a single line, with the text
//   trimmed and XML entity references unescaped.
// - Line breaks inside tags and between tags are dropped during lexing, so
//   source formatting never leaks into the output.
// - Mismatched, unclosed, or truncated documents fail outright; a
//   structural inconsistency invalidates every later indentation decision.
//
// CLI:
//   reformaxml <input> [output]
// Default output: <input stem>_formatted.<extension> next to the input.

use clap::Parser;
use log::debug;
use memchr::{memchr, memchr3};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

const CHUNK_SIZE: usize = 4096;
const INDENT: &[u8] = b"  ";

/// CLI flags
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// XML file to reformat
    input: PathBuf,

    /// Output file (default: <input stem>_formatted.<extension>)
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("reformaxml: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), FormatError> {
    let out_path = cli
        .output
        .clone()
        .unwrap_or_else(|| formatted_output_path(&cli.input));
    debug!(
        "formatting {} into {}",
        cli.input.display(),
        out_path.display()
    );

    let input = File::open(&cli.input)?;
    let mut output = BufWriter::new(File::create(&out_path)?);

    let started = Instant::now();
    format_document(input, &mut output)?;
    output.flush()?;
    println!("Time: {:.3}s", started.elapsed().as_secs_f64());
    Ok(())
}

/// `doc.xml` becomes `doc_formatted.xml`; a file without an extension gets
/// `_formatted` appended to its name.
fn formatted_output_path(input: &Path) -> PathBuf {
    match (input.file_stem(), input.extension()) {
        (Some(stem), Some(ext)) => {
            let mut name = stem.to_os_string();
            name.push("_formatted.");
            name.push(ext);
            input.with_file_name(name)
        }
        _ => {
            let mut name = input
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push("_formatted");
            input.with_file_name(name)
        }
    }
}

/* ================================ Errors ================================ */

/// Failure modes of one formatting run. All of them abort the run; there is
/// no per-tag recovery or partial-success mode.
#[derive(Debug, Error)]
enum FormatError {
    #[error("start and end tags do not match: {open} vs. {close}")]
    TagMismatch { open: String, close: String },

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FormatError {
    fn mismatch(open: &[u8], close: &[u8]) -> Self {
        FormatError::TagMismatch {
            open: String::from_utf8_lossy(open).into_owned(),
            close: String::from_utf8_lossy(close).into_owned(),
        }
    }
}

/* ============================ Utility predicates ======================== */

#[inline]
fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n' || b == b'\r'
}

/* ============================= Chunked lexer ============================ */

/// Forward-only character stream over a `Read` source, refilled one
/// fixed-capacity chunk at a time. Characters scanned past collect in a
/// pending-token accumulator, so no token ever depends on where chunk
/// boundaries fall.
struct ChunkedLexer<R: Read> {
    inner: R,
    chunk: Box<[u8]>,
    len: usize,
    pos: usize,
    eof: bool,
    token: Vec<u8>,
}

impl<R: Read> ChunkedLexer<R> {
    fn new(inner: R) -> Self {
        Self::with_capacity(inner, CHUNK_SIZE)
    }

    fn with_capacity(inner: R, capacity: usize) -> Self {
        assert!(capacity > 0);
        ChunkedLexer {
            inner,
            chunk: vec![0; capacity].into_boxed_slice(),
            len: 0,
            pos: 0,
            eof: false,
            token: Vec::new(),
        }
    }

    /// Fills the chunk from the source. Only the last chunk of the stream
    /// may come up short, regardless of how the source slices its reads.
    fn refill(&mut self) -> io::Result<()> {
        self.pos = 0;
        self.len = 0;
        while self.len < self.chunk.len() {
            match self.inner.read(&mut self.chunk[self.len..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn at_end(&mut self) -> io::Result<bool> {
        Ok(self.peek()?.is_none())
    }

    /// Next unconsumed byte, without advancing. `None` once the source and
    /// the current chunk are both exhausted.
    fn peek(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.len {
            if self.eof {
                return Ok(None);
            }
            self.refill()?;
            if self.len == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.chunk[self.pos]))
    }

    /// Appends the current byte to the pending token and steps past it.
    /// With `skip_whitespace`, also steps past the following whitespace run
    /// without collecting it, refilling chunks as needed.
    fn advance(&mut self, skip_whitespace: bool) -> io::Result<()> {
        if let Some(b) = self.peek()? {
            self.token.push(b);
            self.pos += 1;
        }
        if skip_whitespace {
            while let Some(b) = self.peek()? {
                if !is_ws(b) {
                    break;
                }
                self.pos += 1;
            }
        }
        Ok(())
    }

    /// Accumulates bytes into the pending token until `target` is found,
    /// leaving the cursor on the target byte. Line breaks along the way are
    /// consumed without entering the token. Returns `false` if the stream
    /// ends first; the accumulator then holds whatever was scanned.
    fn scan_to(&mut self, target: u8) -> io::Result<bool> {
        loop {
            if self.peek()?.is_none() {
                return Ok(false);
            }
            match memchr3(target, b'\n', b'\r', &self.chunk[self.pos..self.len]) {
                Some(i) => {
                    let found = self.chunk[self.pos + i];
                    self.token
                        .extend_from_slice(&self.chunk[self.pos..self.pos + i]);
                    if found == target {
                        self.pos += i;
                        return Ok(true);
                    }
                    self.pos += i + 1;
                }
                None => {
                    self.token
                        .extend_from_slice(&self.chunk[self.pos..self.len]);
                    self.pos = self.len;
                }
            }
        }
    }

    /// Returns the accumulated pending token and clears the accumulator.
    fn take_token(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.token)
    }
}

/* ============================ Tag classification ======================== */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    /// Self-closing element or the leading XML declaration; rendered on its
    /// own line with no stack interaction.
    SelfContained,
}

fn classify(tag: &[u8]) -> TagKind {
    match tag {
        [_, b'/', ..] => TagKind::Close,
        [_, b'?', ..] => TagKind::SelfContained,
        [.., b'/', b'>'] => TagKind::SelfContained,
        _ => TagKind::Open,
    }
}

/// Tag name: the bytes after `<` (and an optional `/`) up to the first
/// whitespace, `/`, or `>`.
fn tag_name(tag: &[u8]) -> &[u8] {
    let body = match tag {
        [b'<', b'/', rest @ ..] => rest,
        [b'<', rest @ ..] => rest,
        _ => tag,
    };
    let end = body
        .iter()
        .position(|&b| is_ws(b) || b == b'/' || b == b'>')
        .unwrap_or(body.len());
    &body[..end]
}

/// Whether `close` is an end tag whose name equals the name of `open`.
/// Names compare for full equality, not prefix containment.
fn is_matching_close(open: &[u8], close: &[u8]) -> bool {
    close.starts_with(b"</") && tag_name(open) == tag_name(close)
}

/* ============================ Entity handling =========================== */

/// Resolves the predefined XML entities and numeric character references in
/// element text. Unknown or unterminated references pass through verbatim.
fn unescape_entities(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] != b'&' {
            out.push(text[i]);
            i += 1;
            continue;
        }
        let Some(semi) = memchr(b';', &text[i + 1..]).map(|off| i + 1 + off) else {
            out.extend_from_slice(&text[i..]);
            break;
        };
        match &text[i + 1..semi] {
            b"amp" => out.push(b'&'),
            b"lt" => out.push(b'<'),
            b"gt" => out.push(b'>'),
            b"apos" => out.push(b'\''),
            b"quot" => out.push(b'"'),
            name => match decode_char_ref(name) {
                Some(ch) => {
                    let mut enc = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut enc).as_bytes());
                }
                None => out.extend_from_slice(&text[i..=semi]),
            },
        }
        i = semi + 1;
    }
    out
}

fn decode_char_ref(name: &[u8]) -> Option<char> {
    let digits = name.strip_prefix(b"#")?;
    let code = if let Some(hex) = digits.strip_prefix(b"x").or_else(|| digits.strip_prefix(b"X")) {
        u32::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?
    } else {
        std::str::from_utf8(digits).ok()?.parse().ok()?
    };
    char::from_u32(code)
}

/* =============================== Formatter ============================== */

/// Open-tag line held back one iteration, so it can be rewritten into a
/// self-closing line if its matching close tag arrives with no content in
/// between.
struct PendingTag {
    tag: Vec<u8>,
    depth: usize,
}

impl PendingTag {
    fn flush_as_is<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_tag_line(out, self.depth, &self.tag)
    }

    /// `<tag ...>` becomes `<tag .../>` on one line.
    fn flush_fused<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_indent(out, self.depth)?;
        out.write_all(&self.tag[..self.tag.len() - 1])?;
        out.write_all(b"/>\n")
    }
}

fn write_indent<W: Write>(out: &mut W, depth: usize) -> io::Result<()> {
    for _ in 0..depth {
        out.write_all(INDENT)?;
    }
    Ok(())
}

fn write_tag_line<W: Write>(out: &mut W, depth: usize, tag: &[u8]) -> io::Result<()> {
    write_indent(out, depth)?;
    out.write_all(tag)?;
    out.write_all(b"\n")
}

/// Reformats one XML document from `input` onto `out`, one tag (or fused
/// self-closing element, or inline-text leaf) per line.
///
/// Both streams are expected to be already open; the caller owns their
/// lifecycle. Output is written incrementally, and at most one line is ever
/// held back (see [`PendingTag`]).
fn format_document<R: Read, W: Write>(input: R, out: W) -> Result<(), FormatError> {
    format_from(ChunkedLexer::new(input), out)
}

fn format_from<R: Read, W: Write>(
    mut lexer: ChunkedLexer<R>,
    mut out: W,
) -> Result<(), FormatError> {
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut pending: Option<PendingTag> = None;

    while !lexer.at_end()? {
        if !lexer.scan_to(b'<')? {
            let trailing = lexer.take_token();
            if trailing.iter().all(|&b| is_ws(b)) {
                break;
            }
            return Err(FormatError::Malformed(
                "content after the document root".into(),
            ));
        }
        lexer.take_token(); // text between tags, whitespace by assumption
        if !lexer.scan_to(b'>')? {
            return Err(FormatError::Malformed("input ended inside a tag".into()));
        }
        lexer.advance(true)?; // take the '>' and the whitespace run behind it
        let tag = lexer.take_token();

        match classify(&tag) {
            TagKind::Close => {
                let open = stack.pop().ok_or_else(|| {
                    FormatError::Malformed(format!(
                        "end tag {} has no matching start tag",
                        String::from_utf8_lossy(&tag)
                    ))
                })?;
                if !is_matching_close(&open, &tag) {
                    return Err(FormatError::mismatch(&open, &tag));
                }
                match pending.take() {
                    // A pending line always holds the tag just popped, so
                    // the name check above already proved the pair fuses.
                    Some(p) => {
                        debug_assert!(is_matching_close(&p.tag, &tag));
                        p.flush_fused(&mut out)?;
                    }
                    None => write_tag_line(&mut out, stack.len(), &tag)?,
                }
            }
            TagKind::SelfContained => {
                if let Some(p) = pending.take() {
                    p.flush_as_is(&mut out)?;
                }
                write_tag_line(&mut out, stack.len(), &tag)?;
            }
            TagKind::Open => {
                if lexer.peek()? == Some(b'<') {
                    // Nesting point: hold the line back until the next tag
                    // shows whether the element is empty.
                    if let Some(p) = pending.take() {
                        p.flush_as_is(&mut out)?;
                    }
                    pending = Some(PendingTag {
                        tag: tag.clone(),
                        depth: stack.len(),
                    });
                    stack.push(tag);
                } else {
                    // Inline text; the next tag must be the matching close.
                    if !lexer.scan_to(b'<')? {
                        return Err(FormatError::Malformed(format!(
                            "input ended inside the content of {}",
                            String::from_utf8_lossy(&tag)
                        )));
                    }
                    let raw = lexer.take_token();
                    let text = unescape_entities(raw.trim_ascii());
                    if !lexer.scan_to(b'>')? {
                        return Err(FormatError::Malformed("input ended inside a tag".into()));
                    }
                    lexer.advance(true)?;
                    let close = lexer.take_token();
                    if !is_matching_close(&tag, &close) {
                        return Err(FormatError::mismatch(&tag, &close));
                    }
                    if let Some(p) = pending.take() {
                        p.flush_as_is(&mut out)?;
                    }
                    write_indent(&mut out, stack.len())?;
                    out.write_all(&tag)?;
                    out.write_all(&text)?;
                    out.write_all(&close)?;
                    out.write_all(b"\n")?;
                }
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(FormatError::Malformed(format!(
            "input ended with {} unclosed tag(s); innermost is {}",
            stack.len(),
            String::from_utf8_lossy(open)
        )));
    }
    Ok(())
}

/* ================================= Tests ================================ */
