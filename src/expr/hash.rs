//! Key hashing for tuple and map lookup.
//!
//! A wyhash-class mixer: 64-bit multiply-fold over 16 byte blocks. Only the low 32 bits are
//! stored in expression nodes where they serve as a pre-filter before key comparison.

const P0: u64 = 0xa076_1d64_78bd_642f;
const P1: u64 = 0xe703_7ed1_a0b4_28db;
const P2: u64 = 0x8ebc_6af0_9c88_c6e3;

#[inline(always)]
fn mum(a: u64, b: u64) -> u64 {
    let r = (a as u128).wrapping_mul(b as u128);
    (r as u64) ^ ((r >> 64) as u64)
}

#[inline(always)]
fn r8(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[inline(always)]
fn r4(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf) as u64
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let len = bytes.len();
    let mut seed = P0;
    let (a, b) = if len <= 16 {
        if len >= 4 {
            let shift = (len >> 3) << 2;
            (
                (r4(bytes, 0) << 32) | r4(bytes, shift),
                (r4(bytes, len - 4) << 32) | r4(bytes, len - 4 - shift),
            )
        } else if len > 0 {
            let a = ((bytes[0] as u64) << 16) | ((bytes[len >> 1] as u64) << 8) | bytes[len - 1] as u64;
            (a, 0)
        } else {
            (0, 0)
        }
    } else {
        let mut i = 0;
        while len - i > 16 {
            seed = mum(r8(bytes, i) ^ P1, r8(bytes, i + 8) ^ seed);
            i += 16;
        }
        (r8(bytes, len - 16), r8(bytes, len - 8))
    };
    mum(P1 ^ len as u64, mum(a ^ P1, b ^ seed))
}

/// Hash used by expression keys. Equal keys always produce equal hashes.
pub trait KeyHash {
    fn key_hash(&self) -> u64;

    fn key_hash32(&self) -> u32 {
        self.key_hash() as u32
    }
}

impl KeyHash for [u8] {
    fn key_hash(&self) -> u64 {
        hash_bytes(self)
    }
}

impl KeyHash for str {
    fn key_hash(&self) -> u64 {
        hash_bytes(self.as_bytes())
    }
}

impl KeyHash for i64 {
    fn key_hash(&self) -> u64 {
        mum((*self as u64) ^ P2, P1)
    }
}
