//! Test doubles shared by the unit tests.

use crate::transport::Transport;
use std::collections::VecDeque;

/// A scripted [`Transport`] with pre-loaded request/response pairs.
///
/// Expectations are consumed in order: each `write_all` is matched against
/// the next expected request and its response becomes readable through
/// subsequent `read_chunk` calls. A mismatch fails the test immediately.
pub struct MockTransport {
    expectations: VecDeque<(Vec<u8>, Vec<u8>)>,
    pending: Vec<u8>,
    cursor: usize,
    sent: Vec<Vec<u8>>,
    /// When set, writes are accepted but nothing is ever readable.
    silent: bool,
    dtr_log: Vec<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            expectations: VecDeque::new(),
            pending: Vec::new(),
            cursor: 0,
            sent: Vec::new(),
            silent: false,
            dtr_log: Vec::new(),
        }
    }

    /// A transport that swallows writes and never produces data.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new()
        }
    }

    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations
            .push_back((request.to_vec(), response.to_vec()));
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn dtr_log(&self) -> &[bool] {
        &self.dtr_log
    }

    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }
}

impl Transport for MockTransport {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.silent {
            return Ok(0);
        }
        let remaining = &self.pending[self.cursor.min(self.pending.len())..];
        if remaining.is_empty() {
            return Ok(0);
        }
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sent.push(bytes.to_vec());
        if self.silent {
            return Ok(());
        }
        match self.expectations.pop_front() {
            Some((request, response)) => {
                assert_eq!(
                    bytes,
                    request.as_slice(),
                    "unexpected bytes sent: expected {:?}, got {:?}",
                    String::from_utf8_lossy(&request),
                    String::from_utf8_lossy(bytes),
                );
                self.pending = response;
                self.cursor = 0;
                Ok(())
            }
            None => panic!(
                "no more expectations in mock transport, sent {:?}",
                String::from_utf8_lossy(bytes)
            ),
        }
    }

    fn set_dtr(&mut self, level: bool) -> std::io::Result<()> {
        self.dtr_log.push(level);
        Ok(())
    }
}
