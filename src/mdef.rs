//! The binary model definition. This maps context-dependent triphones onto
//! senone sequences and transition matrices, which is everything the search
//! needs to instantiate an HMM for a phone in context. The on-disk format is
//! the `BMDF` layout with a compact array-encoded context-decision tree, so a
//! triphone lookup is a four level walk (word position, base phone, left
//! context, right context) over contiguous node ranges rather than a hash
//! probe per query.
use crate::error::{Result, SttError};
use std::fmt::Write as _;
use std::io::{Read, Write};
use tracing::{info, warn};

pub const BIN_MDEF_FORMAT_VERSION: i32 = 1;
const MAGIC: &[u8; 4] = b"BMDF";
const MAGIC_SWAPPED: &[u8; 4] = b"FDMB";

/// Sentinel phone/senone id used inside the CD tree for "no triphone here,
/// back off to the CI phone".
pub const NO_PHONE: i32 = -1;
pub const NO_SENONE: i32 = -1;
pub const NO_CIPHONE: i32 = -1;

const FORMAT_DESC: &str = "\
BEGIN FILE FORMAT DESCRIPTION\n\
int32 n_ciphone;    /**< Number of base (CI) phones */\n\
int32 n_phone;      /**< Number of base (CI) phones + (CD) triphones */\n\
int32 n_emit_state; /**< Number of emitting states per phone (0 if heterogeneous) */\n\
int32 n_ci_sen;     /**< Number of CI senones; these are the first */\n\
int32 n_sen;        /**< Number of senones (CI+CD) */\n\
int32 n_tmat;       /**< Number of transition matrices */\n\
int32 n_sseq;       /**< Number of unique senone sequences */\n\
int32 n_ctx;        /**< Number of phones of context */\n\
int32 n_cd_tree;    /**< Number of nodes in CD tree structure */\n\
int32 sil;          /**< CI phone ID for silence */\n\
char ciphones[][];  /**< CI phone strings (null-terminated) */\n\
char padding[];     /**< Padding to a 4-bytes boundary */\n\
struct { int16 ctx; int16 n_down; int32 pid/down } cd_tree[];\n\
struct { int32 ssid; int32 tmat; int8 attr[4] } phones[];\n\
int32 sseq[];       /**< Unique senone sequences */\n\
END FILE FORMAT DESCRIPTION\n";

/// Position of a triphone within its word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WordPosition {
    Internal = 0,
    Begin = 1,
    End = 2,
    Single = 3,
}

pub const N_WORD_POSN: usize = 4;

impl WordPosition {
    pub fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Self::Internal),
            1 => Some(Self::Begin),
            2 => Some(Self::End),
            3 => Some(Self::Single),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        // Keep the classic single letter names for phone_str output.
        b"ibes"[self as usize] as char
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdTreeNode {
    /// Context (phone id or word position) matched at this node.
    pub ctx: i16,
    /// Number of children; 0 makes this a leaf and `down_or_pid` a phone id.
    pub n_down: i16,
    /// Index of the first child, or the leaf phone id (possibly `NO_PHONE`).
    pub down_or_pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneInfo {
    Ci { filler: bool },
    Cd { wpos: WordPosition, ci: u8, lc: u8, rc: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneEntry {
    pub ssid: i32,
    pub tmat: i32,
    pub info: PhoneInfo,
}

pub struct BinMdef {
    n_ciphone: usize,
    n_emit_state: usize,
    n_ci_sen: usize,
    n_sen: usize,
    n_tmat: usize,
    n_ctx: usize,
    sil: i32,
    ciname: Vec<String>,
    cd_tree: Vec<CdTreeNode>,
    phones: Vec<PhoneEntry>,
    /// Unique senone sequences, `n_sseq * n_emit_state` flat.
    sseq: Vec<u16>,
    n_sseq: usize,
    /// CD senone → the CI senone in the same state position, for score
    /// fallback when a CD senone was never computed.
    cd2cisen: Vec<i32>,
    /// Senone → owning CI phone.
    sen2cimap: Vec<i32>,
}

impl BinMdef {
    pub fn n_ciphone(&self) -> usize {
        self.n_ciphone
    }

    pub fn n_phone(&self) -> usize {
        self.phones.len()
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_sen(&self) -> usize {
        self.n_sen
    }

    pub fn n_ci_sen(&self) -> usize {
        self.n_ci_sen
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_sseq(&self) -> usize {
        self.n_sseq
    }

    pub fn silence_ciphone(&self) -> i32 {
        self.sil
    }

    /// Exact binary search over the sorted CI phone names.
    pub fn ciphone_id(&self, name: &str) -> Option<i32> {
        self.ciname
            .binary_search_by(|probe| probe.as_str().cmp(name))
            .ok()
            .map(|i| i as i32)
    }

    pub fn ciphone_str(&self, ci: i32) -> &str {
        &self.ciname[ci as usize]
    }

    pub fn is_filler(&self, pid: i32) -> bool {
        match self.phones[pid as usize].info {
            PhoneInfo::Ci { filler } => filler,
            PhoneInfo::Cd { ci, .. } => self.is_filler(ci as i32),
        }
    }

    pub fn phone(&self, pid: i32) -> &PhoneEntry {
        &self.phones[pid as usize]
    }

    pub fn pid_to_ci(&self, pid: i32) -> i32 {
        match self.phones[pid as usize].info {
            PhoneInfo::Ci { .. } => pid,
            PhoneInfo::Cd { ci, .. } => ci as i32,
        }
    }

    pub fn sseq(&self, ssid: i32) -> &[u16] {
        let start = ssid as usize * self.n_emit_state;
        &self.sseq[start..start + self.n_emit_state]
    }

    pub fn phone_sseq(&self, pid: i32) -> &[u16] {
        self.sseq(self.phones[pid as usize].ssid)
    }

    pub fn cd_to_ci_sen(&self, sid: i32) -> i32 {
        self.cd2cisen[sid as usize]
    }

    pub fn sen_to_ci(&self, sid: i32) -> i32 {
        self.sen2cimap[sid as usize]
    }

    /// Map fillers (other than silence itself) to the silence CI before a
    /// context lookup, as context.
    fn context_of(&self, ci: i32) -> i32 {
        if self.sil != NO_CIPHONE {
            if let PhoneInfo::Ci { filler: true } = self.phones[ci as usize].info {
                return self.sil;
            }
        }
        ci
    }

    /// Walk the CD tree for an exact triphone. `None` means there is no such
    /// triphone (including the explicit back-off leaves).
    pub fn phone_id(&self, ci: i32, lc: i32, rc: i32, wpos: WordPosition) -> Option<i32> {
        debug_assert!((ci as usize) < self.n_ciphone);
        debug_assert!((lc as usize) < self.n_ciphone);
        debug_assert!((rc as usize) < self.n_ciphone);
        let ctx = [
            wpos as i16,
            self.context_of(ci) as i16,
            self.context_of(lc) as i16,
            self.context_of(rc) as i16,
        ];

        let mut at = 0usize;
        let mut max = N_WORD_POSN;
        for want in ctx {
            let nodes = &self.cd_tree[at..at + max];
            let hit = nodes.iter().find(|n| n.ctx == want)?;
            if hit.n_down == 0 {
                // Leaf. Above the rc level this is a back-off marker.
                return (hit.down_or_pid != NO_PHONE).then_some(hit.down_or_pid);
            }
            at = hit.down_or_pid as usize;
            max = hit.n_down as usize;
        }
        None
    }

    /// Like [`phone_id`](Self::phone_id) but falls back across word positions
    /// and finally to the CI phone, so callers always get something usable
    /// for an HMM.
    pub fn phone_id_nearest(&self, ci: i32, lc: i32, rc: i32, wpos: WordPosition) -> i32 {
        if let Some(pid) = self.phone_id(ci, lc, rc, wpos) {
            return pid;
        }
        for alt in [
            WordPosition::Single,
            WordPosition::Internal,
            WordPosition::Begin,
            WordPosition::End,
        ] {
            if alt == wpos {
                continue;
            }
            if let Some(pid) = self.phone_id(ci, lc, rc, alt) {
                return pid;
            }
        }
        ci
    }

    pub fn phone_str(&self, pid: i32) -> String {
        let mut out = String::new();
        match self.phones[pid as usize].info {
            PhoneInfo::Ci { .. } => out.push_str(self.ciphone_str(pid)),
            PhoneInfo::Cd { wpos, ci, lc, rc } => {
                let _ = write!(
                    out,
                    "{}({},{}){}",
                    self.ciphone_str(ci as i32),
                    self.ciphone_str(lc as i32),
                    self.ciphone_str(rc as i32),
                    wpos.as_char()
                );
            }
        }
        out
    }

    /// Derive the CD→CI senone maps from the senone sequences. This is the
    /// only accurate way to do it, though still approximate under cross-state
    /// tying.
    fn build_sen_maps(&mut self) {
        self.cd2cisen = (0..self.n_sen)
            .map(|i| if i < self.n_ci_sen { i as i32 } else { NO_SENONE })
            .collect();
        self.sen2cimap = vec![NO_CIPHONE; self.n_sen];
        for pid in 0..self.phones.len() {
            let ci = self.pid_to_ci(pid as i32);
            let ci_ssid = self.phones[ci as usize].ssid;
            for j in 0..self.n_emit_state {
                let s = self.sseq(self.phones[pid].ssid)[j] as usize;
                if self.sen2cimap[s] == NO_CIPHONE {
                    self.sen2cimap[s] = ci;
                } else if self.sen2cimap[s] != ci {
                    warn!("Senone {} is shared between multiple base phones", s);
                }
                self.cd2cisen[s] = self.sseq(ci_ssid)[j] as i32;
            }
        }
    }

    pub fn read(mut rdr: impl Read) -> Result<Self> {
        let mut buf = Vec::new();
        rdr.read_to_end(&mut buf)?;
        let mut c = ByteCursor::new(&buf);

        let magic = c.take(4)?;
        let swap = if magic == MAGIC {
            false
        } else if magic == MAGIC_SWAPPED {
            info!("Byte-swapped model definition");
            true
        } else {
            return Err(SttError::bad_format("mdef", "missing BMDF magic"));
        };
        c.swap = swap;

        let version = c.i32()?;
        if version > BIN_MDEF_FORMAT_VERSION {
            return Err(SttError::bad_format(
                "mdef",
                format!("format version {} is newer than library", version),
            ));
        }
        let desc_len = c.i32()?;
        c.skip(desc_len as usize)?;

        let n_ciphone = c.i32()? as usize;
        let n_phone = c.i32()? as usize;
        let n_emit_state = c.i32()? as usize;
        let n_ci_sen = c.i32()? as usize;
        let n_sen = c.i32()? as usize;
        let n_tmat = c.i32()? as usize;
        let n_sseq = c.i32()? as usize;
        let n_ctx = c.i32()? as usize;
        let n_cd_tree = c.i32()? as usize;
        let sil = c.i32()?;
        if n_emit_state == 0 {
            return Err(SttError::bad_format(
                "mdef",
                "heterogeneous topologies are not supported",
            ));
        }

        let names_start = c.pos;
        let mut ciname = Vec::with_capacity(n_ciphone);
        for _ in 0..n_ciphone {
            ciname.push(c.cstr()?);
        }
        for pair in ciname.windows(2) {
            if pair[0] >= pair[1] {
                return Err(SttError::bad_format(
                    "mdef",
                    "phone names are not in sorted order",
                ));
            }
        }
        // Padding to a 4-byte boundary relative to the name blob start.
        let consumed = c.pos - names_start;
        c.skip(((consumed + 3) & !3) - consumed)?;

        let mut cd_tree = Vec::with_capacity(n_cd_tree);
        for _ in 0..n_cd_tree {
            cd_tree.push(CdTreeNode {
                ctx: c.i16()?,
                n_down: c.i16()?,
                down_or_pid: c.i32()?,
            });
        }

        let mut phones = Vec::with_capacity(n_phone);
        for pid in 0..n_phone {
            let ssid = c.i32()?;
            let tmat = c.i32()?;
            let attr = c.take(4)?;
            let info = if pid < n_ciphone {
                PhoneInfo::Ci {
                    filler: attr[0] != 0,
                }
            } else {
                PhoneInfo::Cd {
                    wpos: WordPosition::from_index(attr[0]).ok_or_else(|| {
                        SttError::bad_format("mdef", format!("bad word position {}", attr[0]))
                    })?,
                    ci: attr[1],
                    lc: attr[2],
                    rc: attr[3],
                }
            };
            if ssid < 0 || ssid as usize >= n_sseq {
                return Err(SttError::out_of_range(
                    "mdef",
                    format!("phone {} has senone sequence {}", pid, ssid),
                ));
            }
            phones.push(PhoneEntry { ssid, tmat, info });
        }

        let sseq_size = c.i32()? as usize;
        if sseq_size != n_sseq * n_emit_state {
            return Err(SttError::bad_format(
                "mdef",
                format!(
                    "senone sequence table is {} entries, expected {}",
                    sseq_size,
                    n_sseq * n_emit_state
                ),
            ));
        }
        let mut sseq = Vec::with_capacity(sseq_size);
        for _ in 0..sseq_size {
            sseq.push(c.u16()?);
        }
        if let Some(bad) = sseq.iter().find(|&&s| s as usize >= n_sen) {
            return Err(SttError::out_of_range(
                "mdef",
                format!("senone id {} out of {}", bad, n_sen),
            ));
        }

        let mut mdef = Self {
            n_ciphone,
            n_emit_state,
            n_ci_sen,
            n_sen,
            n_tmat,
            n_ctx,
            sil,
            ciname,
            cd_tree,
            phones,
            sseq,
            n_sseq,
            cd2cisen: Vec::new(),
            sen2cimap: Vec::new(),
        };
        // Trust the stored silence id only if it matches the name table.
        mdef.sil = mdef.ciphone_id("SIL").unwrap_or(mdef.sil);
        mdef.build_sen_maps();
        info!(
            "{} CI-phone, {} CD-phone, {} emitstate/phone, {} CI-sen, {} Sen, {} Sen-Seq",
            mdef.n_ciphone,
            mdef.phones.len() - mdef.n_ciphone,
            mdef.n_emit_state,
            mdef.n_ci_sen,
            mdef.n_sen,
            mdef.n_sseq
        );
        Ok(mdef)
    }

    /// Write the canonical little-endian encoding.
    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&BIN_MDEF_FORMAT_VERSION.to_le_bytes())?;
        let desc = FORMAT_DESC.as_bytes();
        let padded = (desc.len() + 1 + 3) & !3;
        w.write_all(&(padded as i32).to_le_bytes())?;
        w.write_all(desc)?;
        w.write_all(&vec![0u8; padded - desc.len()])?;

        for v in [
            self.n_ciphone as i32,
            self.phones.len() as i32,
            self.n_emit_state as i32,
            self.n_ci_sen as i32,
            self.n_sen as i32,
            self.n_tmat as i32,
            self.n_sseq as i32,
            self.n_ctx as i32,
            self.cd_tree.len() as i32,
            self.sil,
        ] {
            w.write_all(&v.to_le_bytes())?;
        }

        let mut blob = Vec::new();
        for name in &self.ciname {
            blob.extend_from_slice(name.as_bytes());
            blob.push(0);
        }
        let padded = (blob.len() + 3) & !3;
        blob.resize(padded, 0);
        w.write_all(&blob)?;

        for node in &self.cd_tree {
            w.write_all(&node.ctx.to_le_bytes())?;
            w.write_all(&node.n_down.to_le_bytes())?;
            w.write_all(&node.down_or_pid.to_le_bytes())?;
        }
        for p in &self.phones {
            w.write_all(&p.ssid.to_le_bytes())?;
            w.write_all(&p.tmat.to_le_bytes())?;
            let attr = match p.info {
                PhoneInfo::Ci { filler } => [filler as u8, 0, 0, 0],
                PhoneInfo::Cd { wpos, ci, lc, rc } => [wpos as u8, ci, lc, rc],
            };
            w.write_all(&attr)?;
        }
        w.write_all(&((self.n_sseq * self.n_emit_state) as i32).to_le_bytes())?;
        for s in &self.sseq {
            w.write_all(&s.to_le_bytes())?;
        }
        Ok(())
    }
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    swap: bool,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            swap: false,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SttError::bad_format("mdef", "truncated file"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn i32(&mut self) -> Result<i32> {
        let b: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if self.swap {
            i32::from_be_bytes(b)
        } else {
            i32::from_le_bytes(b)
        })
    }

    fn i16(&mut self) -> Result<i16> {
        let b: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(if self.swap {
            i16::from_be_bytes(b)
        } else {
            i16::from_le_bytes(b)
        })
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(self.i16()? as u16)
    }

    fn cstr(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return Err(SttError::bad_format("mdef", "unterminated phone name"));
        }
        let s = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| SttError::bad_format("mdef", "phone name is not ASCII"))?
            .to_string();
        self.pos += 1;
        Ok(s)
    }
}

/// In-memory construction of a model definition, used for building a model
/// from text sources and for synthetic models in tests. Triphones are
/// gathered first, then `build` lays out the array-encoded CD tree level by
/// level the same way the binary writer expects to find it.
pub struct MdefBuilder {
    n_emit_state: usize,
    ciphones: Vec<(String, bool, i32, i32)>,
    triphones: Vec<(u8, u8, u8, WordPosition, i32, i32)>,
    sseq: Vec<u16>,
    n_ci_sen: usize,
    n_sen: usize,
    n_tmat: usize,
}

impl MdefBuilder {
    pub fn new(n_emit_state: usize) -> Self {
        Self {
            n_emit_state,
            ciphones: Vec::new(),
            triphones: Vec::new(),
            sseq: Vec::new(),
            n_ci_sen: 0,
            n_sen: 0,
            n_tmat: 0,
        }
    }

    fn add_sseq(&mut self, senones: &[u16]) -> i32 {
        assert_eq!(senones.len(), self.n_emit_state);
        let ssid = (self.sseq.len() / self.n_emit_state) as i32;
        self.sseq.extend_from_slice(senones);
        for &s in senones {
            self.n_sen = self.n_sen.max(s as usize + 1);
        }
        ssid
    }

    /// CI phones must be added in sorted name order.
    pub fn ciphone(&mut self, name: &str, filler: bool, senones: &[u16], tmat: i32) -> &mut Self {
        let ssid = self.add_sseq(senones);
        self.ciphones.push((name.to_string(), filler, ssid, tmat));
        self.n_ci_sen = self.n_sen;
        self.n_tmat = self.n_tmat.max(tmat as usize + 1);
        self
    }

    pub fn triphone(
        &mut self,
        ci: i32,
        lc: i32,
        rc: i32,
        wpos: WordPosition,
        senones: &[u16],
        tmat: i32,
    ) -> &mut Self {
        let ssid = self.add_sseq(senones);
        self.triphones
            .push((ci as u8, lc as u8, rc as u8, wpos, ssid, tmat));
        self.n_tmat = self.n_tmat.max(tmat as usize + 1);
        self
    }

    pub fn build(self) -> Result<BinMdef> {
        let n_ciphone = self.ciphones.len();
        for pair in self.ciphones.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(SttError::bad_format(
                    "mdef",
                    "phone names are not in sorted order",
                ));
            }
        }

        let mut phones = Vec::new();
        for (_, filler, ssid, tmat) in &self.ciphones {
            phones.push(PhoneEntry {
                ssid: *ssid,
                tmat: *tmat,
                info: PhoneInfo::Ci { filler: *filler },
            });
        }

        // Sort triphones into tree order so each level's children are
        // contiguous.
        let mut tri = self.triphones.clone();
        tri.sort_by_key(|&(ci, lc, rc, wpos, _, _)| (wpos as u8, ci, lc, rc));
        for &(ci, lc, rc, wpos, ssid, tmat) in &tri {
            phones.push(PhoneEntry {
                ssid,
                tmat,
                info: PhoneInfo::Cd { wpos, ci, lc, rc },
            });
        }

        // Level layouts: wpos nodes, then CI nodes per wpos, then LC nodes,
        // then RC leaves.
        let mut cd_tree = Vec::new();
        for w in 0..N_WORD_POSN {
            cd_tree.push(CdTreeNode {
                ctx: w as i16,
                n_down: n_ciphone as i16,
                down_or_pid: 0,
            });
        }
        let ci_start = cd_tree.len();
        for w in 0..N_WORD_POSN {
            cd_tree[w].down_or_pid = (ci_start + w * n_ciphone) as i32;
            for ci in 0..n_ciphone {
                let _ = ci;
                cd_tree.push(CdTreeNode {
                    ctx: 0,
                    n_down: 0,
                    down_or_pid: NO_PHONE,
                });
            }
        }
        // Group triphones under (wpos, ci) and emit LC then RC levels.
        let mut lc_nodes: Vec<CdTreeNode> = Vec::new();
        let mut rc_nodes: Vec<CdTreeNode> = Vec::new();
        let lc_start_guess = cd_tree.len();
        // First pass counts LC nodes so RC indices can be computed.
        let mut n_lc_total = 0usize;
        {
            let mut i = 0;
            while i < tri.len() {
                let (ci, _, _, wpos, _, _) = tri[i];
                let mut j = i;
                let mut lcs = Vec::new();
                while j < tri.len() && tri[j].0 == ci && tri[j].3 == wpos {
                    if !lcs.contains(&tri[j].1) {
                        lcs.push(tri[j].1);
                    }
                    j += 1;
                }
                n_lc_total += lcs.len();
                i = j;
            }
        }
        let rc_start = lc_start_guess + n_lc_total;

        let mut i = 0;
        while i < tri.len() {
            let (ci, _, _, wpos, _, _) = tri[i];
            let mut j = i;
            while j < tri.len() && tri[j].0 == ci && tri[j].3 == wpos {
                j += 1;
            }
            let group = &tri[i..j];
            let ci_node = ci_start + (wpos as usize) * n_ciphone + ci as usize;
            cd_tree[ci_node].ctx = ci as i16;
            cd_tree[ci_node].down_or_pid = (lc_start_guess + lc_nodes.len()) as i32;
            let mut k = 0;
            let mut n_lc_here = 0i16;
            while k < group.len() {
                let lc = group[k].1;
                let mut m = k;
                while m < group.len() && group[m].1 == lc {
                    m += 1;
                }
                let first_rc = rc_start + rc_nodes.len();
                for (off, &(_, _, rc, _, _, _)) in group[k..m].iter().enumerate() {
                    // Phone ids follow the sorted triphone order after the CI
                    // block.
                    let pid_index = i + k + off;
                    rc_nodes.push(CdTreeNode {
                        ctx: rc as i16,
                        n_down: 0,
                        down_or_pid: (n_ciphone + pid_index) as i32,
                    });
                }
                lc_nodes.push(CdTreeNode {
                    ctx: lc as i16,
                    n_down: (m - k) as i16,
                    down_or_pid: first_rc as i32,
                });
                n_lc_here += 1;
                k = m;
            }
            cd_tree[ci_node].n_down = n_lc_here;
            i = j;
        }
        // CI nodes with no triphones keep ctx 0 from initialization; fix the
        // ctx so lookups still resolve them (as leaves with NO_PHONE).
        for w in 0..N_WORD_POSN {
            for ci in 0..n_ciphone {
                let node = ci_start + w * n_ciphone + ci;
                if cd_tree[node].n_down == 0 {
                    cd_tree[node].ctx = ci as i16;
                }
            }
        }
        cd_tree.extend(lc_nodes);
        cd_tree.extend(rc_nodes);

        let n_sseq = self.sseq.len() / self.n_emit_state;
        let mut mdef = BinMdef {
            n_ciphone,
            n_emit_state: self.n_emit_state,
            n_ci_sen: self.n_ci_sen,
            n_sen: self.n_sen,
            n_tmat: self.n_tmat,
            n_ctx: 3,
            sil: NO_CIPHONE,
            ciname: self.ciphones.into_iter().map(|c| c.0).collect(),
            cd_tree,
            phones,
            sseq: self.sseq,
            n_sseq,
            cd2cisen: Vec::new(),
            sen2cimap: Vec::new(),
        };
        mdef.sil = mdef.ciphone_id("SIL").unwrap_or(NO_CIPHONE);
        mdef.build_sen_maps();
        Ok(mdef)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Small model shared by several test modules: three real phones, SIL,
    /// and a couple of triphones.
    pub(crate) fn tiny_mdef() -> BinMdef {
        let mut b = MdefBuilder::new(3);
        b.ciphone("AH", false, &[0, 1, 2], 0)
            .ciphone("F", false, &[3, 4, 5], 1)
            .ciphone("R", false, &[6, 7, 8], 2)
            .ciphone("SIL", true, &[9, 10, 11], 3);
        // F(SIL,AH)b, AH(F,R)i, R(AH,SIL)e
        b.triphone(1, 3, 0, WordPosition::Begin, &[12, 13, 14], 1)
            .triphone(0, 1, 2, WordPosition::Internal, &[15, 16, 17], 0)
            .triphone(2, 0, 3, WordPosition::End, &[18, 19, 20], 2);
        b.build().unwrap()
    }

    #[test]
    fn ciphone_lookup() {
        let m = tiny_mdef();
        assert_eq!(m.ciphone_id("AH"), Some(0));
        assert_eq!(m.ciphone_id("SIL"), Some(3));
        assert_eq!(m.ciphone_id("ZH"), None);
        assert_eq!(m.silence_ciphone(), 3);
        assert!(m.is_filler(3));
        assert!(!m.is_filler(0));
    }

    #[test]
    fn triphone_lookup_and_identity() {
        let m = tiny_mdef();
        let pid = m.phone_id(1, 3, 0, WordPosition::Begin).unwrap();
        assert!(pid >= m.n_ciphone() as i32);
        match m.phone(pid).info {
            PhoneInfo::Cd { wpos, ci, lc, rc } => {
                assert_eq!(m.phone_id(ci as i32, lc as i32, rc as i32, wpos), Some(pid));
            }
            _ => panic!("expected CD phone"),
        }
        // Missing context backs off.
        assert_eq!(m.phone_id(1, 0, 0, WordPosition::Begin), None);
        assert_eq!(m.phone_id_nearest(1, 0, 0, WordPosition::Begin), 1);
    }

    #[test]
    fn every_cd_phone_round_trips() {
        let m = tiny_mdef();
        for pid in m.n_ciphone() as i32..m.n_phone() as i32 {
            if let PhoneInfo::Cd { wpos, ci, lc, rc } = m.phone(pid).info {
                assert_eq!(
                    m.phone_id(ci as i32, lc as i32, rc as i32, wpos),
                    Some(pid),
                    "{}",
                    m.phone_str(pid)
                );
            }
        }
    }

    #[test]
    fn filler_context_maps_to_silence() {
        let mut b = MdefBuilder::new(3);
        b.ciphone("++NOISE++", true, &[12, 13, 14], 4)
            .ciphone("AH", false, &[0, 1, 2], 0)
            .ciphone("F", false, &[3, 4, 5], 1)
            .ciphone("R", false, &[6, 7, 8], 2)
            .ciphone("SIL", true, &[9, 10, 11], 3);
        b.triphone(2, 1, 4, WordPosition::Begin, &[15, 16, 17], 1);
        let m = b.build().unwrap();
        let pid = m.phone_id(2, 1, 4, WordPosition::Begin).unwrap();
        // The noise filler as right context resolves to the same triphone as
        // silence does.
        assert_eq!(m.phone_id(2, 1, 0, WordPosition::Begin), Some(pid));
    }

    #[test]
    fn binary_round_trip() {
        let m = tiny_mdef();
        let mut bytes = Vec::new();
        m.write(&mut bytes).unwrap();
        let m2 = BinMdef::read(Cursor::new(&bytes)).unwrap();
        assert_eq!(m.n_ciphone(), m2.n_ciphone());
        assert_eq!(m.n_phone(), m2.n_phone());
        assert_eq!(m.n_sen(), m2.n_sen());
        for pid in 0..m.n_phone() as i32 {
            assert_eq!(m.phone_sseq(pid), m2.phone_sseq(pid));
            assert_eq!(m.phone(pid), m2.phone(pid));
        }
        // Byte-for-byte stability of the canonical encoding.
        let mut bytes2 = Vec::new();
        m2.write(&mut bytes2).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            BinMdef::read(Cursor::new(b"NOPE".to_vec())),
            Err(SttError::BadFormat { .. })
        ));
    }

    #[test]
    fn senone_maps() {
        let m = tiny_mdef();
        // CI senones map to themselves.
        for s in 0..m.n_ci_sen() as i32 {
            assert_eq!(m.cd_to_ci_sen(s), s);
        }
        // CD senones map to the CI senone in the same state slot.
        let pid = m.phone_id(0, 1, 2, WordPosition::Internal).unwrap();
        let cd = m.phone_sseq(pid)[1] as i32;
        assert_eq!(m.cd_to_ci_sen(cd), m.phone_sseq(0)[1] as i32);
        assert_eq!(m.sen_to_ci(cd), 0);
    }
}
