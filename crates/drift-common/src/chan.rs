// chan.rs -- per-connection reliable/unreliable channel over UDP
//
// Datagram layout, little-endian:
//
//   u32 w1    bit 31: reliable block present
//             bit 30: fragment datagram
//             bits 0..=29: outgoing sequence
//   u32 w2    bit 31: echo of the peer's reliable toggle (ack)
//             bit 30: toggle of the reliable block carried by this side
//             bits 0..=29: highest sequence seen from the peer (ack)
//
//   fragment:  u16 offset, u16 length, fragment bytes, nothing else
//   otherwise: [u16 rel_len, reliable block] unreliable block to the end
//
// Both blocks are sequences of frames (u16 length + one application
// message). One reliable block is in flight per direction; send_reliable
// stages frames which rotate into the pending slot, flipping the 1-bit
// toggle, once the previous block is acknowledged. A block is resent when
// the peer provably missed it (it acknowledged a later sequence while still
// echoing the old toggle) or when the resend timer expires; the explicit
// toggle in the header lets the receiver discard duplicates either way.
// Blocks larger than MAX_FRAGMENT go out as a burst of fragment datagrams,
// terminated by a short (possibly empty) final fragment.
//
// Stale datagrams (sequence <= last seen) are dropped, so unreliable
// delivery degrades to losses only, never reordering.

use crate::buf::{msg_read_u16, msg_read_u32, MsgBuf};
use crate::common::con_dprintf;
use crate::netadr::NetAdr;

/// Largest datagram the channel will emit.
pub const MAX_DATAGRAM: usize = 1400;
/// w1/w2 header words.
pub const CHAN_HEADER: usize = 8;
/// Reliable blocks above this size are fragmented.
pub const MAX_FRAGMENT: usize = 1200;
/// Upper bound on a reliable block (staging plus pending).
pub const MAX_RELIABLE: usize = 32 * 1024;

/// Resend/probe cadence for an unacknowledged reliable block.
pub const RELIABLE_RESEND_MS: u64 = 100;
/// Idle connections emit a header-only datagram at this cadence.
pub const KEEPALIVE_MS: u64 = 1000;
/// Silence past this point means the peer is gone.
pub const CONN_TIMEOUT_MS: u64 = 8000;

const RELIABLE_BIT: u32 = 1 << 31;
const FRAGMENT_BIT: u32 = 1 << 30;
const SEQ_MASK: u32 = (1 << 30) - 1;

/// Messages extracted from one processed datagram, reliable frames first.
#[derive(Debug, Default)]
pub struct ChanIncoming {
    pub reliable: Vec<Vec<u8>>,
    pub unreliable: Vec<Vec<u8>>,
}

pub struct NetChan {
    pub remote: NetAdr,

    // sequencing
    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_acknowledged: u32,

    // reliable send state
    reliable_staging: Vec<u8>,
    reliable_pending: Vec<u8>,
    reliable_sequence: u32,
    incoming_reliable_acknowledged: u32,
    last_reliable_sequence: u32,
    last_reliable_sent: u64,

    // reliable receive state
    incoming_reliable_sequence: u32,

    // fragment reassembly
    frag_buffer: Vec<u8>,
    frag_in_progress: bool,

    // unreliable staging for the next transmit
    unreliable_staging: Vec<u8>,

    ack_needed: bool,
    pub last_received: u64,
    pub last_sent: u64,
}

impl NetChan {
    pub fn new(remote: NetAdr, now: u64) -> Self {
        Self {
            remote,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            reliable_staging: Vec::new(),
            reliable_pending: Vec::new(),
            reliable_sequence: 0,
            incoming_reliable_acknowledged: 0,
            last_reliable_sequence: 0,
            last_reliable_sent: 0,
            incoming_reliable_sequence: 0,
            frag_buffer: Vec::new(),
            frag_in_progress: false,
            unreliable_staging: Vec::new(),
            ack_needed: false,
            last_received: now,
            last_sent: now,
        }
    }

    /// Queue one message for ordered, guaranteed delivery. Returns false if
    /// the reliable backlog is full or the message cannot be framed.
    pub fn send_reliable(&mut self, msg: &[u8]) -> bool {
        if msg.is_empty() || msg.len() > u16::MAX as usize {
            return false;
        }
        if self.reliable_staging.len() + 2 + msg.len() > MAX_RELIABLE {
            con_dprintf("chan: reliable backlog full, message dropped\n");
            return false;
        }
        self.reliable_staging
            .extend_from_slice(&(msg.len() as u16).to_le_bytes());
        self.reliable_staging.extend_from_slice(msg);
        true
    }

    /// Queue one best-effort message for the next transmit.
    pub fn send_unreliable(&mut self, msg: &[u8]) -> bool {
        if msg.is_empty() || msg.len() > u16::MAX as usize {
            return false;
        }
        if self.unreliable_staging.len() + 2 + msg.len() > MAX_DATAGRAM - CHAN_HEADER {
            con_dprintf("chan: dumped unreliable\n");
            return false;
        }
        self.unreliable_staging
            .extend_from_slice(&(msg.len() as u16).to_le_bytes());
        self.unreliable_staging.extend_from_slice(msg);
        true
    }

    pub fn reliable_in_flight(&self) -> bool {
        !self.reliable_pending.is_empty() || !self.reliable_staging.is_empty()
    }

    pub fn timed_out(&self, now: u64) -> bool {
        now.saturating_sub(self.last_received) > CONN_TIMEOUT_MS
    }

    /// The peer acknowledged a sequence sent after the pending block while
    /// still echoing the old toggle, so the block was definitely lost.
    fn resend_proven(&self) -> bool {
        !self.reliable_pending.is_empty()
            && self.incoming_acknowledged > self.last_reliable_sequence
            && self.incoming_reliable_acknowledged != self.reliable_sequence
    }

    fn resend_due(&self, now: u64) -> bool {
        !self.reliable_pending.is_empty()
            && (self.resend_proven()
                || now.saturating_sub(self.last_reliable_sent) >= RELIABLE_RESEND_MS)
    }

    pub fn needs_transmit(&self, now: u64) -> bool {
        !self.unreliable_staging.is_empty()
            || (self.reliable_pending.is_empty() && !self.reliable_staging.is_empty())
            || self.resend_due(now)
            || self.ack_needed
            || now.saturating_sub(self.last_sent) >= KEEPALIVE_MS
    }

    fn make_w2(&self) -> u32 {
        (self.incoming_reliable_sequence << 31)
            | (self.reliable_sequence << 30)
            | (self.incoming_sequence & SEQ_MASK)
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.outgoing_sequence & SEQ_MASK;
        self.outgoing_sequence += 1;
        seq
    }

    /// Build the datagrams this channel owes the wire. Usually zero or one;
    /// a fragmented reliable block produces a burst.
    pub fn transmit(&mut self, now: u64) -> Vec<Vec<u8>> {
        // rotate staged reliable frames into the in-flight slot
        let mut rotated = false;
        if self.reliable_pending.is_empty() && !self.reliable_staging.is_empty() {
            self.reliable_pending = std::mem::take(&mut self.reliable_staging);
            self.reliable_sequence ^= 1;
            rotated = true;
        }

        let send_reliable = rotated || self.resend_due(now);
        let send_unreliable = !self.unreliable_staging.is_empty();
        let keepalive_due = now.saturating_sub(self.last_sent) >= KEEPALIVE_MS;

        if !(send_reliable || send_unreliable || self.ack_needed || keepalive_due) {
            return Vec::new();
        }

        if send_reliable && self.reliable_pending.len() > MAX_FRAGMENT {
            return self.transmit_fragments(now);
        }

        let mut dgram = Vec::with_capacity(CHAN_HEADER + 2 + self.reliable_pending.len());
        let seq = self.next_seq();
        let mut w1 = seq;
        if send_reliable {
            w1 |= RELIABLE_BIT;
        }
        dgram.extend_from_slice(&w1.to_le_bytes());
        dgram.extend_from_slice(&self.make_w2().to_le_bytes());

        if send_reliable {
            dgram.extend_from_slice(&(self.reliable_pending.len() as u16).to_le_bytes());
            dgram.extend_from_slice(&self.reliable_pending);
            self.last_reliable_sequence = seq;
            self.last_reliable_sent = now;
        }

        if send_unreliable {
            if dgram.len() + self.unreliable_staging.len() <= MAX_DATAGRAM {
                dgram.extend_from_slice(&self.unreliable_staging);
            } else {
                con_dprintf("chan: dumped unreliable\n");
            }
            self.unreliable_staging.clear();
        }

        self.ack_needed = false;
        self.last_sent = now;
        vec![dgram]
    }

    fn transmit_fragments(&mut self, now: u64) -> Vec<Vec<u8>> {
        let total = self.reliable_pending.len();
        let mut out = Vec::new();
        let mut offset = 0usize;

        loop {
            let len = (total - offset).min(MAX_FRAGMENT);
            let mut dgram = Vec::with_capacity(CHAN_HEADER + 4 + len);
            let seq = self.next_seq();
            dgram.extend_from_slice(&(seq | RELIABLE_BIT | FRAGMENT_BIT).to_le_bytes());
            dgram.extend_from_slice(&self.make_w2().to_le_bytes());
            dgram.extend_from_slice(&(offset as u16).to_le_bytes());
            dgram.extend_from_slice(&(len as u16).to_le_bytes());
            dgram.extend_from_slice(&self.reliable_pending[offset..offset + len]);
            out.push(dgram);

            self.last_reliable_sequence = seq;
            offset += len;

            // a short final fragment terminates the burst; an exact multiple
            // needs an empty trailer
            if len < MAX_FRAGMENT {
                break;
            }
            if offset == total {
                let mut tail = Vec::with_capacity(CHAN_HEADER + 4);
                let seq = self.next_seq();
                tail.extend_from_slice(&(seq | RELIABLE_BIT | FRAGMENT_BIT).to_le_bytes());
                tail.extend_from_slice(&self.make_w2().to_le_bytes());
                tail.extend_from_slice(&(offset as u16).to_le_bytes());
                tail.extend_from_slice(&0u16.to_le_bytes());
                out.push(tail);
                self.last_reliable_sequence = seq;
                break;
            }
        }

        self.last_reliable_sent = now;
        self.ack_needed = false;
        self.last_sent = now;
        out
    }

    /// Consume one received datagram. Returns None when it was stale,
    /// malformed, or an incomplete fragment; the connection-level timestamp
    /// is still refreshed for valid-looking traffic.
    pub fn process(&mut self, data: &[u8], now: u64) -> Option<ChanIncoming> {
        if data.len() < CHAN_HEADER || data.len() > MAX_DATAGRAM {
            return None;
        }

        let mut sb = MsgBuf::from_slice(data);
        let w1 = msg_read_u32(&mut sb)?;
        let w2 = msg_read_u32(&mut sb)?;
        if w1 == u32::MAX {
            // out-of-band, not ours
            return None;
        }

        let seq = w1 & SEQ_MASK;
        let has_reliable = w1 & RELIABLE_BIT != 0;
        let fragmented = w1 & FRAGMENT_BIT != 0;

        let peer_ack_seq = w2 & SEQ_MASK;
        let peer_echo = (w2 >> 31) & 1;
        let peer_toggle = (w2 >> 30) & 1;

        // discard stale and duplicated datagrams
        if seq <= self.incoming_sequence {
            return None;
        }
        self.incoming_sequence = seq;
        self.incoming_acknowledged = self.incoming_acknowledged.max(peer_ack_seq);
        self.incoming_reliable_acknowledged = peer_echo;
        self.last_received = now;

        // the peer has seen our current block; stop resending it
        if peer_echo == self.reliable_sequence && !self.reliable_pending.is_empty() {
            self.reliable_pending.clear();
        }

        let mut out = ChanIncoming::default();

        if fragmented {
            if !has_reliable {
                return None;
            }
            self.ack_needed = true;
            if self.process_fragment(&mut sb, peer_toggle, &mut out).is_none() {
                return None;
            }
            return Some(out);
        }

        if has_reliable {
            self.ack_needed = true;
            let rel_len = msg_read_u16(&mut sb)? as usize;
            if rel_len > sb.remaining() {
                return None;
            }
            let block_start = sb.readcount;
            sb.readcount += rel_len;
            if peer_toggle != self.incoming_reliable_sequence {
                self.incoming_reliable_sequence = peer_toggle;
                let block = sb.data[block_start..block_start + rel_len].to_vec();
                parse_frames(&block, &mut out.reliable);
            }
            // same toggle: duplicate block, skip it but still acknowledge
        }

        let rest = &sb.data[sb.readcount..sb.cursize];
        parse_frames(rest, &mut out.unreliable);
        Some(out)
    }

    fn process_fragment(
        &mut self,
        sb: &mut MsgBuf,
        peer_toggle: u32,
        out: &mut ChanIncoming,
    ) -> Option<()> {
        let offset = msg_read_u16(sb)? as usize;
        let len = msg_read_u16(sb)? as usize;
        if len > sb.remaining() {
            return None;
        }

        // burst for a block we already delivered; acknowledge and drop
        if peer_toggle == self.incoming_reliable_sequence {
            return Some(());
        }

        if offset == 0 {
            self.frag_buffer.clear();
            self.frag_in_progress = true;
        } else if !self.frag_in_progress || offset != self.frag_buffer.len() {
            // gap; wait for the burst to restart
            self.frag_buffer.clear();
            self.frag_in_progress = false;
            return Some(());
        }

        let start = sb.readcount;
        self.frag_buffer.extend_from_slice(&sb.data[start..start + len]);
        if self.frag_buffer.len() > MAX_RELIABLE {
            self.frag_buffer.clear();
            self.frag_in_progress = false;
            return None;
        }

        if len < MAX_FRAGMENT {
            // complete block
            self.frag_in_progress = false;
            self.incoming_reliable_sequence = peer_toggle;
            let block = std::mem::take(&mut self.frag_buffer);
            parse_frames(&block, &mut out.reliable);
        }
        Some(())
    }
}

fn parse_frames(block: &[u8], out: &mut Vec<Vec<u8>>) {
    let mut at = 0usize;
    while at + 2 <= block.len() {
        let len = u16::from_le_bytes([block[at], block[at + 1]]) as usize;
        at += 2;
        if len == 0 || at + len > block.len() {
            break;
        }
        out.push(block[at..at + len].to_vec());
        at += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(now: u64) -> (NetChan, NetChan) {
        let a = NetChan::new(NetAdr::new([127, 0, 0, 1], 2), now);
        let b = NetChan::new(NetAdr::new([127, 0, 0, 1], 1), now);
        (a, b)
    }

    fn deliver(from: &mut NetChan, to: &mut NetChan, now: u64) -> ChanIncoming {
        let mut all = ChanIncoming::default();
        for dgram in from.transmit(now) {
            if let Some(mut inc) = to.process(&dgram, now) {
                all.reliable.append(&mut inc.reliable);
                all.unreliable.append(&mut inc.unreliable);
            }
        }
        all
    }

    #[test]
    fn reliable_roundtrip_and_ack() {
        let (mut a, mut b) = pair(0);
        assert!(a.send_reliable(b"welcome"));

        let got = deliver(&mut a, &mut b, 10);
        assert_eq!(got.reliable, vec![b"welcome".to_vec()]);
        assert!(!a.reliable_pending.is_empty());

        // b owes an ack; a clears the block on receipt
        let _ = deliver(&mut b, &mut a, 20);
        assert!(!a.reliable_in_flight());
    }

    #[test]
    fn reliable_survives_loss() {
        let (mut a, mut b) = pair(0);
        a.send_reliable(b"start");

        // first datagram lost
        let lost = a.transmit(10);
        assert_eq!(lost.len(), 1);

        // resend timer fires; block arrives exactly once
        let got = deliver(&mut a, &mut b, 10 + RELIABLE_RESEND_MS);
        assert_eq!(got.reliable, vec![b"start".to_vec()]);
    }

    #[test]
    fn duplicate_block_not_redelivered() {
        let (mut a, mut b) = pair(0);
        a.send_reliable(b"once");

        let got = deliver(&mut a, &mut b, 10);
        assert_eq!(got.reliable.len(), 1);

        // a has not seen the ack yet and resends; b must not deliver twice
        let got = deliver(&mut a, &mut b, 10 + RELIABLE_RESEND_MS);
        assert!(got.reliable.is_empty());
    }

    #[test]
    fn reliable_blocks_stay_ordered() {
        let (mut a, mut b) = pair(0);
        a.send_reliable(b"first");
        a.send_reliable(b"second");

        // both frames share one block and arrive in order
        let got = deliver(&mut a, &mut b, 10);
        assert_eq!(got.reliable, vec![b"first".to_vec(), b"second".to_vec()]);

        // next block only rotates in after the ack
        a.send_reliable(b"third");
        assert!(deliver(&mut a, &mut b, 20).reliable.is_empty());
        let _ = deliver(&mut b, &mut a, 30);
        let got = deliver(&mut a, &mut b, 40);
        assert_eq!(got.reliable, vec![b"third".to_vec()]);
    }

    #[test]
    fn stale_datagrams_dropped() {
        let (mut a, mut b) = pair(0);
        a.send_unreliable(b"one");
        let d1 = a.transmit(10).remove(0);
        a.send_unreliable(b"two");
        let d2 = a.transmit(20).remove(0);

        // reordered arrival: the late earlier datagram is discarded
        assert!(b.process(&d2, 30).is_some());
        assert!(b.process(&d1, 30).is_none());
    }

    #[test]
    fn unreliable_frames_delivered() {
        let (mut a, mut b) = pair(0);
        a.send_unreliable(b"snap1");
        a.send_unreliable(b"snap2");
        let got = deliver(&mut a, &mut b, 10);
        assert_eq!(got.unreliable, vec![b"snap1".to_vec(), b"snap2".to_vec()]);
    }

    #[test]
    fn fragmented_block_reassembles() {
        let (mut a, mut b) = pair(0);
        let big = vec![0xABu8; 5000];
        assert!(a.send_reliable(&big));

        let burst = a.transmit(10);
        assert!(burst.len() >= 5);

        let mut got = Vec::new();
        for dgram in burst {
            if let Some(mut inc) = b.process(&dgram, 10) {
                got.append(&mut inc.reliable);
            }
        }
        assert_eq!(got, vec![big]);
    }

    #[test]
    fn fragment_burst_exact_multiple() {
        let (mut a, mut b) = pair(0);
        // frame header makes the block 2 + n bytes; pick n so the block is an
        // exact fragment multiple
        let big = vec![7u8; MAX_FRAGMENT * 2 - 2];
        assert!(a.send_reliable(&big));

        let burst = a.transmit(10);
        // two full fragments plus the empty trailer
        assert_eq!(burst.len(), 3);

        let mut got = Vec::new();
        for dgram in burst {
            if let Some(mut inc) = b.process(&dgram, 10) {
                got.append(&mut inc.reliable);
            }
        }
        assert_eq!(got, vec![big]);
    }

    #[test]
    fn fragment_burst_resend_after_loss() {
        let (mut a, mut b) = pair(0);
        let big = vec![3u8; 4000];
        a.send_reliable(&big);

        // drop the middle fragment; receiver resets and waits
        let burst = a.transmit(10);
        for (i, dgram) in burst.iter().enumerate() {
            if i == 1 {
                continue;
            }
            let inc = b.process(dgram, 10);
            assert!(inc.is_none() || inc.unwrap().reliable.is_empty());
        }

        // full burst again on the resend timer
        let burst = a.transmit(10 + RELIABLE_RESEND_MS);
        let mut got = Vec::new();
        for dgram in burst {
            if let Some(mut inc) = b.process(&dgram, 300) {
                got.append(&mut inc.reliable);
            }
        }
        assert_eq!(got, vec![big]);
    }

    #[test]
    fn keepalive_flows_when_idle() {
        let (mut a, mut b) = pair(0);
        assert!(a.transmit(10).is_empty());

        let dgrams = a.transmit(KEEPALIVE_MS);
        assert_eq!(dgrams.len(), 1);
        assert!(b.process(&dgrams[0], KEEPALIVE_MS).is_some());
        assert_eq!(b.last_received, KEEPALIVE_MS);
    }

    #[test]
    fn timeout_detection() {
        let (a, _) = pair(0);
        assert!(!a.timed_out(CONN_TIMEOUT_MS));
        assert!(a.timed_out(CONN_TIMEOUT_MS + 1));
    }
}
