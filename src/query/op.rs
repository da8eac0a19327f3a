//! Per-request flow: SWITCHDB, namespace check, planning, MULTISTMT
//! validation, then row pagination with client-driven CONTINUE/DISCARD
//! (within a statement) and QUERY_NEXT/DISCARD (between statements) — see
//! the asymmetry called out where the request is decoded, it is preserved
//! verbatim from the source behavior this module is modeled on.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::query::session::Session;
use crate::query::{QueryPlan, Row, RowCursor, StatementExecutor};
use crate::varint::{get_lenenc_string, get_varuint, put_lenenc_string, put_varuint};
use crate::wire::{Frame, Opcode, QueryFlags};

const DEFAULT_SOFT_FRAME_BYTES: usize = 1 << 20;

/// Decoded payload of an inbound `QUERY` frame. `flags` is the frame's own
/// `flags` field reinterpreted as `QueryFlags` — the query path doesn't
/// duplicate it inside the payload.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_text: String,
    pub flags: QueryFlags,
    pub max_rows: u64,
    pub database: Option<String>,
}

impl QueryRequest {
    pub fn decode(frame: &Frame) -> Result<Self> {
        let flags = QueryFlags::from_bits_truncate(frame.flags);
        let mut body = frame.payload.clone();
        let query_text = get_lenenc_string(&mut body)?;
        let max_rows = get_varuint(&mut body)?;
        let database = if body.has_remaining() && body.get_u8() == 1 {
            Some(get_lenenc_string(&mut body)?)
        } else {
            None
        };
        Ok(Self {
            query_text,
            flags,
            max_rows,
            database,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_lenenc_string(&mut buf, &self.query_text);
        put_varuint(&mut buf, self.max_rows);
        match &self.database {
            Some(db) => {
                buf.put_u8(1);
                put_lenenc_string(&mut buf, db);
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(Opcode::Query.as_u16(), self.flags.bits(), self.encode())
    }
}

/// Drives one `QUERY` request over a blocking connection on its own worker
/// thread (see the concurrency model: the query op never shares a thread
/// with the async client or with other connections).
pub struct QueryOp<'a, E: StatementExecutor> {
    executor: &'a E,
    session: &'a Session,
    soft_frame_bytes: usize,
}

impl<'a, E: StatementExecutor> QueryOp<'a, E> {
    pub fn new(executor: &'a E, session: &'a Session) -> Self {
        Self {
            executor,
            session,
            soft_frame_bytes: DEFAULT_SOFT_FRAME_BYTES,
        }
    }

    pub fn with_soft_frame_bytes(mut self, bytes: usize) -> Self {
        self.soft_frame_bytes = bytes;
        self
    }

    /// Handles exactly one inbound `QUERY` frame, including its full
    /// pagination exchange. Returns once the statement(s) are exhausted, the
    /// client discards mid-stream, or a protocol error forces the caller to
    /// close the connection.
    pub fn handle<S: Read + Write>(&self, stream: &mut S, frame: Frame) -> Result<()> {
        let request = QueryRequest::decode(&frame)?;

        if request.flags.contains(QueryFlags::SWITCHDB) {
            let target = request.database.as_deref().unwrap_or_default();
            if !self.session.switch_database(target) {
                return self.send_error(stream, &format!("unknown database: {target}"));
            }
        }

        if self.session.namespace().is_none() {
            return self.send_error(stream, "No database selected");
        }

        let plan = match self.executor.plan(&request.query_text) {
            Ok(plan) => plan,
            Err(e) => return self.send_error(stream, &e.to_string()),
        };

        if plan.statements.len() > 1 && !request.flags.contains(QueryFlags::MULTISTMT) {
            return self.send_error(stream, "multiple statements require MULTISTMT");
        }

        self.stream_statements(stream, plan, request.max_rows, request.flags.contains(QueryFlags::PROGRESS))
    }

    fn stream_statements<S: Read + Write>(
        &self,
        stream: &mut S,
        plan: QueryPlan<E::Cursor>,
        max_rows: u64,
        progress: bool,
    ) -> Result<()> {
        // The source clamps a zero max-rows request up to 1 rather than
        // looping forever or dividing by zero.
        let max_rows = if max_rows == 0 { 1 } else { max_rows } as usize;
        let num_statements = plan.statements.len();
        let mut rows_emitted_total: u64 = 0;

        for (stmt_idx, mut cursor) in plan.statements.into_iter().enumerate() {
            let is_last_statement = stmt_idx + 1 == num_statements;
            // Carries a row already pulled from the cursor while probing
            // whether the previous frame was the last one, so it isn't lost
            // between frames.
            let mut pending_row: Option<Row> = None;

            loop {
                let mut rows = Vec::new();
                let mut bytes = 0usize;
                let mut exhausted = false;

                if let Some(row) = pending_row.take() {
                    bytes += row.encoded_len();
                    rows.push(row);
                }

                while rows.len() < max_rows && bytes < self.soft_frame_bytes {
                    match cursor.next()? {
                        Some(row) => {
                            bytes += row.encoded_len();
                            rows_emitted_total += 1;
                            rows.push(row);
                        }
                        None => {
                            exhausted = true;
                            break;
                        }
                    }

                    if progress && self.session.progress_due() {
                        self.send_progress(stream, rows_emitted_total)?;
                        self.session.mark_progress();
                    }
                    if self.session.heartbeat_due() {
                        self.send_heartbeat(stream)?;
                        self.session.mark_heartbeat();
                    }
                }

                // The batch filled up without the cursor reporting
                // exhaustion; probe one row ahead to find out whether this
                // frame is actually the last one, without consuming a row
                // into the *next* frame's budget.
                if !exhausted {
                    match cursor.next()? {
                        Some(row) => pending_row = Some(row),
                        None => exhausted = true,
                    }
                }

                // Mirrors the source: `has_pending_statement` is only
                // meaningful on the terminal frame of a statement. Every
                // non-terminal frame (the client is about to CONTINUE the
                // same statement) carries it as false.
                let is_last_frame_of_statement = exhausted;
                let has_pending_statement = is_last_frame_of_statement && !is_last_statement;
                self.send_result_frame(stream, &rows, is_last_frame_of_statement, has_pending_statement)?;

                if !is_last_frame_of_statement {
                    match self.read_control_opcode(stream)? {
                        Opcode::QueryContinue => continue,
                        Opcode::QueryDiscard => return Ok(()),
                        _ => {
                            return Err(Error::Protocol(
                                "expected QUERY_CONTINUE or QUERY_DISCARD".into(),
                            ))
                        }
                    }
                }

                if is_last_statement {
                    return Ok(());
                }

                match self.read_control_opcode(stream)? {
                    Opcode::QueryNext => break,
                    Opcode::QueryDiscard => return Ok(()),
                    _ => {
                        return Err(Error::Protocol(
                            "expected QUERY_NEXT or QUERY_DISCARD between statements".into(),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn read_control_opcode<S: Read + Write>(&self, stream: &mut S) -> Result<Opcode> {
        let frame = Frame::read_from_sync(stream)?;
        Opcode::from_u16(frame.opcode).ok_or_else(|| {
            Error::Protocol(format!("unexpected opcode 0x{:04x} mid-query", frame.opcode))
        })
    }

    fn send_result_frame<S: Write>(
        &self,
        stream: &mut S,
        rows: &[Row],
        is_last: bool,
        has_pending_statement: bool,
    ) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(is_last as u8);
        buf.put_u8(has_pending_statement as u8);
        put_varuint(&mut buf, rows.len() as u64);
        for row in rows {
            put_varuint(&mut buf, row.0.len() as u64);
            for cell in &row.0 {
                put_varuint(&mut buf, cell.len() as u64);
                buf.extend_from_slice(cell);
            }
        }
        Frame::new(Opcode::QueryResult.as_u16(), 0, buf.freeze()).write_to_sync(stream)
    }

    /// Progress is reported as a permille counter of rows emitted so far,
    /// clamped below 1000. Without planner cardinality estimates (out of
    /// scope) there is no true "percent of total" to report.
    fn send_progress<S: Write>(&self, stream: &mut S, rows_emitted: u64) -> Result<()> {
        let permille = rows_emitted.min(999);
        let mut buf = BytesMut::new();
        put_varuint(&mut buf, permille);
        Frame::new(Opcode::QueryProgress.as_u16(), 0, buf.freeze()).write_to_sync(stream)
    }

    fn send_heartbeat<S: Write>(&self, stream: &mut S) -> Result<()> {
        Frame::new(Opcode::Heartbeat.as_u16(), 0, Bytes::new()).write_to_sync(stream)
    }

    fn send_error<S: Write>(&self, stream: &mut S, message: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        put_lenenc_string(&mut buf, message);
        Frame::new(Opcode::Error.as_u16(), 0, buf.freeze()).write_to_sync(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    struct VecCursor {
        rows: std::vec::IntoIter<Row>,
    }

    impl RowCursor for VecCursor {
        fn num_columns(&self) -> usize {
            1
        }
        fn next(&mut self) -> Result<Option<Row>> {
            Ok(self.rows.next())
        }
    }

    struct FixedExecutor {
        statements: std::cell::RefCell<Vec<Vec<Row>>>,
    }

    impl StatementExecutor for FixedExecutor {
        type Cursor = VecCursor;
        fn plan(&self, _query_text: &str) -> Result<QueryPlan<Self::Cursor>> {
            let statements = self
                .statements
                .borrow_mut()
                .drain(..)
                .map(|rows| VecCursor { rows: rows.into_iter() })
                .collect();
            Ok(QueryPlan { statements })
        }
    }

    fn row(n: u8) -> Row {
        Row(vec![Bytes::from(vec![n])])
    }

    fn session() -> Session {
        Session::new(|name| name == "db1", Duration::from_secs(60), Duration::from_secs(60))
    }

    /// A byte sink doubling as the source of scripted client responses: a
    /// `Duplex` wraps an output `Vec<u8>` and the pre-encoded bytes of the
    /// frames the test wants to feed back as if a real client sent them,
    /// served incrementally like a real stream rather than one frame per
    /// `read` call — `Frame::read_from_sync` issues several small reads
    /// (header, varuint length, payload) per frame, and a `read` that
    /// discarded everything past the first chunk would desync those.
    struct Duplex {
        out: Vec<u8>,
        inbound: Cursor<Vec<u8>>,
    }

    impl Duplex {
        fn new(frames: Vec<Frame>) -> Self {
            let mut bytes = Vec::new();
            for frame in frames {
                bytes.extend_from_slice(&frame.encode());
            }
            Self {
                out: Vec::new(),
                inbound: Cursor::new(bytes),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn decode_all_frames(bytes: &[u8]) -> Vec<Frame> {
        let mut cursor = Cursor::new(bytes.to_vec());
        let mut out = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            match Frame::read_from_sync(&mut cursor) {
                Ok(f) => out.push(f),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn rejects_query_with_no_database_selected() {
        let session = session();
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select 1".into(),
            flags: QueryFlags::empty(),
            max_rows: 10,
            database: None,
        };
        let mut duplex = Duplex::new(Vec::new());
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Error.as_u16());
    }

    #[test]
    fn switchdb_then_single_statement_completes_without_pending() {
        let session = session();
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1), row(2)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select * from t".into(),
            flags: QueryFlags::SWITCHDB,
            max_rows: 10,
            database: Some("db1".into()),
        };
        let mut duplex = Duplex::new(Vec::new());
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::QueryResult.as_u16());
        assert_eq!(frames[0].payload[0], 1); // is_last
        assert_eq!(frames[0].payload[1], 0); // has_pending_statement
    }

    #[test]
    fn pagination_emits_one_frame_per_max_rows_chunk_then_continue() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1), row(2), row(3)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select * from t".into(),
            flags: QueryFlags::empty(),
            max_rows: 2,
            database: None,
        };
        let mut duplex = Duplex::new(vec![Frame::new(Opcode::QueryContinue.as_u16(), 0, Bytes::new())]);
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload[0], 0); // first frame not last
        assert_eq!(frames[1].payload[0], 1); // second frame is last
        assert_eq!(frames[1].payload[1], 0); // no pending statement
    }

    #[test]
    fn discard_mid_statement_stops_further_frames() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1), row(2), row(3), row(4)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select * from t".into(),
            flags: QueryFlags::empty(),
            max_rows: 2,
            database: None,
        };
        let mut duplex = Duplex::new(vec![Frame::new(Opcode::QueryDiscard.as_u16(), 0, Bytes::new())]);
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 1); // only the first page, then DISCARD halted it
    }

    #[test]
    fn multistmt_without_flag_is_rejected() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1)], vec![row(2)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select 1; select 2".into(),
            flags: QueryFlags::empty(),
            max_rows: 10,
            database: None,
        };
        let mut duplex = Duplex::new(Vec::new());
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Error.as_u16());
    }

    #[test]
    fn multistmt_advances_with_query_next_between_statements() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1)], vec![row(2)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select 1; select 2".into(),
            flags: QueryFlags::MULTISTMT,
            max_rows: 10,
            database: None,
        };
        let mut duplex = Duplex::new(vec![Frame::new(Opcode::QueryNext.as_u16(), 0, Bytes::new())]);
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload[1], 1); // has_pending_statement after statement 1
        assert_eq!(frames[1].payload[1], 0); // no pending statement after statement 2
    }

    #[test]
    fn unknown_opcode_mid_statement_is_a_protocol_error() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1), row(2), row(3)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select * from t".into(),
            flags: QueryFlags::empty(),
            max_rows: 2,
            database: None,
        };
        let mut duplex = Duplex::new(vec![Frame::new(0xffff, 0, Bytes::new())]);
        let err = op.handle(&mut duplex, request.to_frame()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn zero_max_rows_is_clamped_to_one() {
        let session = session();
        session.switch_database("db1");
        let executor = FixedExecutor {
            statements: std::cell::RefCell::new(vec![vec![row(1), row(2)]]),
        };
        let op = QueryOp::new(&executor, &session);
        let request = QueryRequest {
            query_text: "select * from t".into(),
            flags: QueryFlags::empty(),
            max_rows: 0,
            database: None,
        };
        let mut duplex = Duplex::new(vec![Frame::new(Opcode::QueryContinue.as_u16(), 0, Bytes::new())]);
        op.handle(&mut duplex, request.to_frame()).unwrap();
        let frames = decode_all_frames(&duplex.out);
        assert_eq!(frames.len(), 2); // one row per frame, not a single frame with both
    }
}
