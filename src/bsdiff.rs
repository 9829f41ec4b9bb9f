//! Whole-file binary diff (bsdiff) and its patcher.
//!
//! The old file is suffix-sorted (Larsson-Sadakane qsufsort). The new file is
//! then scanned for approximate matches, and each region is encoded as an
//! `add` run (bytewise difference against the old file, mostly zeroes) followed
//! by an `extra` run (bytes with no counterpart) and a seek in the old file.
//!
//! This wins over block matching when edits are dense or small and shifted,
//! at the cost of holding both files in memory.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SuturaError};
use crate::ops::MAX_DATA_OP;

/// One bsdiff instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffControl {
    /// Bytes added, wrapping, to the old bytes at the current old position.
    pub add: Vec<u8>,
    /// Bytes copied verbatim.
    pub extra: Vec<u8>,
    /// Relative move of the old position, applied last.
    pub seek: i64,
    /// End of this file's controls.
    pub eof: bool,
}

impl BsdiffControl {
    /// The terminating control.
    #[must_use]
    pub fn eof() -> Self {
        Self {
            eof: true,
            ..Self::default()
        }
    }
}

/// Fresh versus reused bytes of a bsdiff encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BsdiffStats {
    /// Extra bytes plus add bytes that differ from the old file.
    pub fresh_bytes: u64,
    /// Add bytes equal to the old file.
    pub reused_bytes: u64,
}

// =============================================================================
// SUFFIX SORTING
// =============================================================================

/// Suffix array of the old file.
pub struct SuffixArray {
    index: Vec<i32>,
}

#[allow(clippy::cast_sign_loss)]
fn key(v: &[i32], sa: &[i32], at: usize, h: usize) -> i32 {
    v[sa[at] as usize + h]
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::many_single_char_names
)]
fn split(sa: &mut [i32], v: &mut [i32], start: usize, len: usize, h: usize) {
    if len < 16 {
        let mut k = start;
        while k < start + len {
            let mut j = 1;
            let mut x = key(v, sa, k, h);
            let mut i = 1;
            while k + i < start + len {
                let y = key(v, sa, k + i, h);
                if y < x {
                    x = y;
                    j = 0;
                }
                if y == x {
                    sa.swap(k + j, k + i);
                    j += 1;
                }
                i += 1;
            }
            for i in 0..j {
                v[sa[k + i] as usize] = (k + j - 1) as i32;
            }
            if j == 1 {
                sa[k] = -1;
            }
            k += j;
        }
        return;
    }

    let x = key(v, sa, start + len / 2, h);
    let mut jj = start;
    let mut kk = 0;
    for i in start..start + len {
        let y = key(v, sa, i, h);
        if y < x {
            jj += 1;
        }
        if y == x {
            kk += 1;
        }
    }
    kk += jj;

    let (mut i, mut j, mut k) = (start, 0, 0);
    while i < jj {
        let y = key(v, sa, i, h);
        if y < x {
            i += 1;
        } else if y == x {
            sa.swap(i, jj + j);
            j += 1;
        } else {
            sa.swap(i, kk + k);
            k += 1;
        }
    }
    while jj + j < kk {
        if key(v, sa, jj + j, h) == x {
            j += 1;
        } else {
            sa.swap(jj + j, kk + k);
            k += 1;
        }
    }

    if jj > start {
        split(sa, v, start, jj - start, h);
    }
    for i in 0..kk - jj {
        v[sa[jj + i] as usize] = (kk - 1) as i32;
    }
    if jj == kk - 1 {
        sa[jj] = -1;
    }
    if start + len > kk {
        split(sa, v, kk, start + len - kk, h);
    }
}

impl SuffixArray {
    /// Sort every suffix of `old`.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if `old` is too large to index with 32-bit
    /// positions.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn new(old: &[u8]) -> Result<Self> {
        let n = old.len();
        if n >= i32::MAX as usize {
            return Err(SuturaError::Usage(format!(
                "file of {n} bytes is too large to bsdiff"
            )));
        }

        let mut buckets = [0usize; 256];
        for &c in old {
            buckets[c as usize] += 1;
        }
        for i in 1..256 {
            buckets[i] += buckets[i - 1];
        }
        for i in (1..256).rev() {
            buckets[i] = buckets[i - 1];
        }
        buckets[0] = 0;

        let mut sa = vec![0i32; n + 1];
        let mut v = vec![0i32; n + 1];
        for (i, &c) in old.iter().enumerate() {
            buckets[c as usize] += 1;
            sa[buckets[c as usize]] = i as i32;
        }
        sa[0] = n as i32;
        for (i, &c) in old.iter().enumerate() {
            v[i] = buckets[c as usize] as i32;
        }
        v[n] = 0;
        for i in 1..256 {
            if buckets[i] == buckets[i - 1] + 1 {
                sa[buckets[i]] = -1;
            }
        }
        sa[0] = -1;

        let done = -(n as i32 + 1);
        let mut h = 1;
        while sa[0] != done {
            let mut len = 0usize;
            let mut i = 0usize;
            while i < n + 1 {
                if sa[i] < 0 {
                    let run = (-sa[i]) as usize;
                    len += run;
                    i += run;
                } else {
                    if len > 0 {
                        sa[i - len] = -(len as i32);
                    }
                    len = v[sa[i] as usize] as usize + 1 - i;
                    split(&mut sa, &mut v, i, len, h);
                    i += len;
                    len = 0;
                }
            }
            if len > 0 {
                sa[i - len] = -(len as i32);
            }
            h += h;
        }

        for (i, &rank) in v.iter().enumerate() {
            sa[rank as usize] = i as i32;
        }
        Ok(Self { index: sa })
    }

    /// Longest match of a prefix of `new` among the suffixes of `old`, as
    /// `(old position, length)`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn search(&self, old: &[u8], new: &[u8]) -> (usize, usize) {
        let at = |i: usize| self.index[i] as usize;
        let (mut st, mut en) = (0, old.len());
        while en - st >= 2 {
            let mid = st + (en - st) / 2;
            if old[at(mid)..] < *new {
                st = mid;
            } else {
                en = mid;
            }
        }
        let x = matchlen(&old[at(st)..], new);
        let y = matchlen(&old[at(en)..], new);
        if x > y {
            (at(st), x)
        } else {
            (at(en), y)
        }
    }
}

fn matchlen(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// =============================================================================
// DIFF
// =============================================================================

/// Splits controls so no add or extra run exceeds the data op limit, and
/// fills in seeks relative to the patcher's old position.
struct ControlWriter<'a> {
    emit: &'a mut dyn FnMut(BsdiffControl) -> Result<()>,
    pending: Option<BsdiffControl>,
    old_pos: usize,
    stats: BsdiffStats,
}

impl ControlWriter<'_> {
    fn push(&mut self, old_start: usize, add: Vec<u8>, extra: Vec<u8>) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let seek = old_start as i64 - self.old_pos as i64;
        match self.pending.take() {
            Some(mut control) => {
                control.seek = seek;
                self.send(control)?;
            }
            None if seek != 0 => self.send(BsdiffControl {
                seek,
                ..BsdiffControl::default()
            })?,
            None => {}
        }

        let zeroes = add.iter().filter(|&&b| b == 0).count() as u64;
        self.stats.reused_bytes += zeroes;
        self.stats.fresh_bytes += add.len() as u64 - zeroes + extra.len() as u64;
        self.old_pos = old_start + add.len();
        self.pending = Some(BsdiffControl {
            add,
            extra,
            seek: 0,
            eof: false,
        });
        Ok(())
    }

    fn send(&mut self, control: BsdiffControl) -> Result<()> {
        if control.add.len() <= MAX_DATA_OP && control.extra.len() <= MAX_DATA_OP {
            return (self.emit)(control);
        }
        for chunk in control.add.chunks(MAX_DATA_OP) {
            (self.emit)(BsdiffControl {
                add: chunk.to_vec(),
                ..BsdiffControl::default()
            })?;
        }
        let mut extras = control.extra.chunks(MAX_DATA_OP).peekable();
        while let Some(chunk) = extras.next() {
            let last = extras.peek().is_none();
            (self.emit)(BsdiffControl {
                extra: chunk.to_vec(),
                seek: if last { control.seek } else { 0 },
                ..BsdiffControl::default()
            })?;
        }
        if control.extra.is_empty() && control.seek != 0 {
            (self.emit)(BsdiffControl {
                seek: control.seek,
                ..BsdiffControl::default()
            })?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<BsdiffStats> {
        if let Some(control) = self.pending.take() {
            self.send(control)?;
        }
        (self.emit)(BsdiffControl::eof())?;
        Ok(self.stats)
    }
}

/// Diff `new` against `old`, sending controls (terminated by an eof control)
/// to `emit`.
///
/// # Errors
///
/// Returns an error if `old` cannot be indexed or `emit` fails.
pub fn bsdiff(
    old: &[u8],
    new: &[u8],
    emit: &mut dyn FnMut(BsdiffControl) -> Result<()>,
) -> Result<BsdiffStats> {
    let sa = SuffixArray::new(old)?;
    bsdiff_with(&sa, old, new, emit)
}

/// [`bsdiff`] with a suffix array computed beforehand.
///
/// # Errors
///
/// Returns an error if `emit` fails.
#[allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::too_many_lines
)]
pub fn bsdiff_with(
    sa: &SuffixArray,
    old: &[u8],
    new: &[u8],
    emit: &mut dyn FnMut(BsdiffControl) -> Result<()>,
) -> Result<BsdiffStats> {
    let mut writer = ControlWriter {
        emit,
        pending: None,
        old_pos: 0,
        stats: BsdiffStats::default(),
    };
    let old_len = old.len() as isize;
    let new_len = new.len();

    let (mut scan, mut len, mut pos) = (0usize, 0usize, 0usize);
    let (mut last_scan, mut last_pos, mut last_offset) = (0usize, 0usize, 0isize);

    while scan < new_len {
        let mut old_score = 0isize;
        scan += len;
        let mut scsc = scan;
        while scan < new_len {
            (pos, len) = sa.search(old, &new[scan..]);
            while scsc < scan + len {
                let at = scsc as isize + last_offset;
                if at >= 0 && at < old_len && old[at as usize] == new[scsc] {
                    old_score += 1;
                }
                scsc += 1;
            }
            let matched = len as isize;
            if (matched == old_score && len != 0) || matched > old_score + 8 {
                break;
            }
            let at = scan as isize + last_offset;
            if at >= 0 && at < old_len && old[at as usize] == new[scan] {
                old_score -= 1;
            }
            scan += 1;
        }

        if len as isize == old_score && scan != new_len {
            continue;
        }

        // Extend the previous match forward.
        let (mut s, mut best, mut len_f) = (0isize, 0isize, 0usize);
        let mut i = 0usize;
        while last_scan + i < scan && last_pos + i < old.len() {
            if old[last_pos + i] == new[last_scan + i] {
                s += 1;
            }
            i += 1;
            if s * 2 - i as isize > best * 2 - len_f as isize {
                best = s;
                len_f = i;
            }
        }

        // Extend the current match backward.
        let mut len_b = 0usize;
        if scan < new_len {
            let (mut s, mut best) = (0isize, 0isize);
            let mut i = 1usize;
            while scan >= last_scan + i && pos >= i {
                if old[pos - i] == new[scan - i] {
                    s += 1;
                }
                if s * 2 - i as isize > best * 2 - len_b as isize {
                    best = s;
                    len_b = i;
                }
                i += 1;
            }
        }

        // Resolve overlap between the two extensions.
        if last_scan + len_f > scan - len_b {
            let overlap = (last_scan + len_f) - (scan - len_b);
            let (mut s, mut best, mut len_s) = (0isize, 0isize, 0usize);
            for i in 0..overlap {
                if new[last_scan + len_f - overlap + i] == old[last_pos + len_f - overlap + i] {
                    s += 1;
                }
                if new[scan - len_b + i] == old[pos - len_b + i] {
                    s -= 1;
                }
                if s > best {
                    best = s;
                    len_s = i + 1;
                }
            }
            len_f = len_f + len_s - overlap;
            len_b -= len_s;
        }

        let extra_start = last_scan + len_f;
        let extra_end = scan - len_b;
        if len_f > 0 || extra_end > extra_start {
            let add = (0..len_f)
                .map(|i| new[last_scan + i].wrapping_sub(old[last_pos + i]))
                .collect();
            writer.push(last_pos, add, new[extra_start..extra_end].to_vec())?;
        }

        last_scan = scan - len_b;
        last_pos = pos - len_b;
        last_offset = pos as isize - scan as isize;
    }

    let stats = writer.finish()?;
    debug!(
        old = old.len(),
        new = new.len(),
        fresh = stats.fresh_bytes,
        reused = stats.reused_bytes,
        "bsdiff"
    );
    Ok(stats)
}

// =============================================================================
// PATCH
// =============================================================================

/// Applies bsdiff controls against an old file held in memory.
pub struct BsPatcher<'a> {
    old: &'a [u8],
    old_pos: i64,
    new_pos: u64,
    new_size: u64,
    scratch: Vec<u8>,
}

impl<'a> BsPatcher<'a> {
    /// Prepare to rebuild a file of `new_size` bytes from `old`.
    #[must_use]
    pub fn new(old: &'a [u8], new_size: u64) -> Self {
        Self {
            old,
            old_pos: 0,
            new_pos: 0,
            new_size,
            scratch: Vec::new(),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.new_pos
    }

    /// Apply one control. Returns `true` once the eof control was applied.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the control reads outside the old file, writes
    /// past the new size, or ends the file at the wrong size.
    pub fn apply(&mut self, control: &BsdiffControl, out: &mut dyn Write) -> Result<bool> {
        if control.eof {
            if self.new_pos != self.new_size {
                return Err(SuturaError::Malformed(format!(
                    "bsdiff produced {} bytes, expected {}",
                    self.new_pos, self.new_size
                )));
            }
            return Ok(true);
        }

        let grow = (control.add.len() as u64)
            .checked_add(control.extra.len() as u64)
            .and_then(|grow| self.new_pos.checked_add(grow))
            .filter(|&end| end <= self.new_size)
            .map(|end| end - self.new_pos)
            .ok_or_else(|| {
                SuturaError::Malformed("bsdiff control writes past the end of the file".to_string())
            })?;

        if !control.add.is_empty() {
            let start = usize::try_from(self.old_pos).ok();
            let old = start
                .and_then(|start| Some(start..start.checked_add(control.add.len())?))
                .and_then(|range| self.old.get(range))
                .ok_or_else(|| {
                    SuturaError::Malformed(format!(
                        "bsdiff add of {} bytes at {} is outside the old file",
                        control.add.len(),
                        self.old_pos
                    ))
                })?;
            self.scratch.clear();
            self.scratch
                .extend(control.add.iter().zip(old).map(|(a, o)| a.wrapping_add(*o)));
            out.write_all(&self.scratch)?;
            #[allow(clippy::cast_possible_wrap)]
            {
                // the add range lies inside `old`, so this stays below isize::MAX
                self.old_pos += control.add.len() as i64;
            }
        }
        out.write_all(&control.extra)?;
        self.new_pos += grow;
        self.old_pos = self.old_pos.checked_add(control.seek).ok_or_else(|| {
            SuturaError::Malformed(format!(
                "bsdiff seek of {} from {} overflows",
                control.seek, self.old_pos
            ))
        })?;
        Ok(false)
    }
}

/// Rebuild a whole file from `old` and `controls`.
///
/// # Errors
///
/// Returns `Malformed` on corrupt controls or a missing eof control.
pub fn bspatch<'c>(
    old: &[u8],
    new_size: u64,
    controls: impl IntoIterator<Item = &'c BsdiffControl>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut patcher = BsPatcher::new(old, new_size);
    for control in controls {
        if patcher.apply(control, out)? {
            return Ok(());
        }
    }
    Err(SuturaError::Malformed(
        "bsdiff controls end without eof".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diff(old: &[u8], new: &[u8]) -> (Vec<BsdiffControl>, BsdiffStats) {
        let mut controls = Vec::new();
        let stats = bsdiff(old, new, &mut |c| {
            controls.push(c);
            Ok(())
        })
        .unwrap();
        (controls, stats)
    }

    fn patch(old: &[u8], new_size: usize, controls: &[BsdiffControl]) -> Vec<u8> {
        let mut out = Vec::new();
        bspatch(old, new_size as u64, controls, &mut out).unwrap();
        out
    }

    fn pattern(len: usize) -> Vec<u8> {
        [0x42u8, 0x69].iter().copied().cycle().take(len).collect()
    }

    // ==========================================================================
    // SUFFIX ARRAY
    // ==========================================================================

    #[test]
    fn suffix_array_is_sorted() {
        let old = b"banana bandana";
        let sa = SuffixArray::new(old).unwrap();
        assert_eq!(sa.index.len(), old.len() + 1);
        assert_eq!(sa.index[0] as usize, old.len());
        for pair in sa.index[1..].windows(2) {
            assert!(old[pair[0] as usize..] < old[pair[1] as usize..]);
        }
    }

    #[test]
    fn search_finds_longest_match() {
        let old = b"the quick brown fox jumps";
        let sa = SuffixArray::new(old).unwrap();
        let (pos, len) = sa.search(old, b"brown fo!");
        assert_eq!((pos, len), (10, 8));
        let (_, len) = sa.search(old, b"zzz");
        assert_eq!(len, 0);
    }

    // ==========================================================================
    // DIFF / PATCH
    // ==========================================================================

    #[test]
    fn identical_is_all_reused() {
        let old = pattern(10_000);
        let (controls, stats) = diff(&old, &old);
        assert_eq!(stats.fresh_bytes, 0);
        assert_eq!(stats.reused_bytes, 10_000);
        assert!(controls.last().unwrap().eof);
        assert_eq!(patch(&old, old.len(), &controls), old);
    }

    #[test]
    fn small_edit_in_periodic_data() {
        let old = pattern(200 * 1024);
        let mut new = old.clone();
        for b in &mut new[100 * 1024..100 * 1024 + 10] {
            *b = 0x00;
        }
        let (controls, stats) = diff(&old, &new);
        assert_eq!(stats.fresh_bytes, 10);
        assert_eq!(stats.reused_bytes, new.len() as u64 - 10);
        assert_eq!(patch(&old, new.len(), &controls), new);
    }

    #[test]
    fn empty_inputs() {
        let (controls, stats) = diff(b"", b"brand new");
        assert_eq!(stats.fresh_bytes, 9);
        assert_eq!(patch(b"", 9, &controls), b"brand new");

        let (controls, stats) = diff(b"old stuff", b"");
        assert_eq!(stats, BsdiffStats::default());
        assert_eq!(controls, vec![BsdiffControl::eof()]);
    }

    #[test]
    fn large_extra_is_split() {
        let new: Vec<u8> = (0..MAX_DATA_OP + 100).map(|i| (i % 251) as u8).collect();
        let (controls, _) = diff(b"x", &new);
        assert!(controls
            .iter()
            .all(|c| c.add.len() <= MAX_DATA_OP && c.extra.len() <= MAX_DATA_OP));
        assert_eq!(patch(b"x", new.len(), &controls), new);
    }

    // ==========================================================================
    // CORRUPTION
    // ==========================================================================

    #[test]
    fn add_outside_old_is_malformed() {
        let control = BsdiffControl {
            add: vec![0; 10],
            ..BsdiffControl::default()
        };
        let mut out = Vec::new();
        let err = bspatch(b"short", 10, [&control, &BsdiffControl::eof()], &mut out).unwrap_err();
        assert!(matches!(err, SuturaError::Malformed(_)));
    }

    #[test]
    fn overlong_output_is_malformed() {
        let control = BsdiffControl {
            extra: vec![1; 20],
            ..BsdiffControl::default()
        };
        let mut out = Vec::new();
        assert!(bspatch(b"", 10, [&control], &mut out).is_err());
    }

    #[test]
    fn short_output_is_malformed() {
        let mut out = Vec::new();
        let err = bspatch(b"", 10, [&BsdiffControl::eof()], &mut out).unwrap_err();
        assert!(matches!(err, SuturaError::Malformed(_)));
    }

    #[test]
    fn missing_eof_is_malformed() {
        let mut out = Vec::new();
        assert!(bspatch(b"", 0, [], &mut out).is_err());
    }

    #[test]
    fn seek_overflow_is_malformed() {
        let forward = BsdiffControl {
            seek: i64::MAX,
            ..BsdiffControl::default()
        };
        let mut out = Vec::new();
        let err = bspatch(b"old", 0, [&forward, &forward], &mut out).unwrap_err();
        assert!(matches!(err, SuturaError::Malformed(_)), "{err:?}");

        let backward = BsdiffControl {
            seek: i64::MIN,
            ..BsdiffControl::default()
        };
        let err = bspatch(b"old", 0, [&backward, &backward], &mut out).unwrap_err();
        assert!(matches!(err, SuturaError::Malformed(_)), "{err:?}");
    }

    #[test]
    fn huge_new_size_does_not_overflow() {
        let control = BsdiffControl {
            extra: vec![7; 4],
            ..BsdiffControl::default()
        };
        let mut patcher = BsPatcher::new(b"", u64::MAX);
        let mut out = Vec::new();
        assert!(!patcher.apply(&control, &mut out).unwrap());
        assert_eq!(patcher.written(), 4);
        assert_eq!(out, vec![7; 4]);
    }

    // ==========================================================================
    // PROPERTIES
    // ==========================================================================

    mod proptests {
        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn patch_reconstructs_new(
                old in proptest::collection::vec(any::<u8>(), 0..4096),
                new in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let (controls, stats) = diff(&old, &new);
                prop_assert_eq!(patch(&old, new.len(), &controls), new.clone());
                let added: u64 = controls.iter().map(|c| (c.add.len() + c.extra.len()) as u64).sum();
                prop_assert_eq!(added, new.len() as u64);
                prop_assert_eq!(stats.fresh_bytes + stats.reused_bytes, new.len() as u64);
            }

            #[test]
            fn edits_roundtrip(
                old in proptest::collection::vec(0u8..4, 1..4096),
                at in any::<prop::sample::Index>(),
                insert in proptest::collection::vec(any::<u8>(), 0..64),
            ) {
                let cut = at.index(old.len());
                let mut new = old[..cut].to_vec();
                new.extend_from_slice(&insert);
                new.extend_from_slice(&old[cut..]);
                let (controls, _) = diff(&old, &new);
                prop_assert_eq!(patch(&old, new.len(), &controls), new);
            }
        }
    }
}
