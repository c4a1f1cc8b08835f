//! Modular arithmetic over a cyclic multiplicative group of large prime
//! order, and the exclusively-owned group elements that flow through round
//! buffers.
//!
//! Every [`Int`] is stamped with the fingerprint of the group that created
//! it. All arithmetic checks the stamp of every operand, so an element can
//! never silently migrate between groups and an erased buffer can never be
//! fed back into a computation.

pub mod buffer;

pub use self::buffer::IntBuffer;

use num::{bigint::RandBigInt, BigInt, BigUint, Integer, One, Zero};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Well-known group parameters, delivered as hex strings in the signed
/// network-definition document.
pub mod params {
    /// The 2048-bit MODP prime of RFC 3526, group 14.
    pub const MODP_2048_PRIME: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// The generator that goes with [`MODP_2048_PRIME`].
    pub const MODP_2048_GENERATOR: &str = "2";

    /// The small prime used for coprime exponent sampling.
    pub const MODP_2048_Q: &str = "10001";
}

/// An error produced by group arithmetic or (de)serialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    /// The decoded value is not in `[1, p)`.
    #[error("value is outside of the group")]
    OutsideOfGroup,
    /// An operand was created by a different group, or was erased.
    #[error("operand fingerprint {operand:#018x} does not match group fingerprint {group:#018x}")]
    FingerprintMismatch { group: u64, operand: u64 },
    /// The exponent shares a factor with the group order.
    #[error("exponent is not coprime to the group order")]
    NotCoprime,
    /// A group parameter was not valid hex.
    #[error("group parameter is not a valid hex string")]
    InvalidEncoding,
}

/// A group element, exclusively owned by the buffer or round that created
/// it.
///
/// The fingerprint is the stamp of the originating [`CyclicGroup`]; it is
/// zeroed by [`Int::erase`], after which every arithmetic operation on the
/// element fails with [`GroupError::FingerprintMismatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Int {
    value: BigUint,
    fingerprint: u64,
}

impl Int {
    /// The element's value.
    pub fn value(&self) -> &BigUint {
        &self.value
    }

    /// The canonical big-endian byte encoding of the value.
    pub fn bytes(&self) -> Vec<u8> {
        self.value.to_bytes_be()
    }

    /// The stamp of the group that created this element.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Whether the element is the multiplicative identity.
    pub fn is_one(&self) -> bool {
        self.value.is_one()
    }

    /// Zeroes the value and invalidates the fingerprint.
    pub fn erase(&mut self) {
        self.value = BigUint::zero();
        self.fingerprint = 0;
    }
}

/// A cyclic multiplicative group: a large prime `p`, a generator `g` and a
/// small prime `q`.
///
/// The group carries a fingerprint (a stable hash of its parameters) that
/// every element created by it is stamped with.
#[derive(Debug, Clone)]
pub struct CyclicGroup {
    prime: BigUint,
    generator: BigUint,
    prime_q: BigUint,
    /// `p - 1`, the order of the full multiplicative group.
    psub1: BigUint,
    fingerprint: u64,
}

impl CyclicGroup {
    /// Creates a group from its parameters.
    pub fn new(prime: BigUint, generator: BigUint, prime_q: BigUint) -> Self {
        let fingerprint = fingerprint(&prime, &generator, &prime_q);
        let psub1 = &prime - 1u8;
        Self {
            prime,
            generator,
            prime_q,
            psub1,
            fingerprint,
        }
    }

    /// Creates a group from hex-encoded parameters, as found in the
    /// network-definition document.
    pub fn from_hex(prime: &str, generator: &str, prime_q: &str) -> Result<Self, GroupError> {
        Ok(Self::new(
            biguint_from_hex(prime)?,
            biguint_from_hex(generator)?,
            biguint_from_hex(prime_q)?,
        ))
    }

    /// The group's stable parameter hash.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// The prime modulus `p`.
    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// The generator `g`.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// The small prime `q`.
    pub fn prime_q(&self) -> &BigUint {
        &self.prime_q
    }

    /// A fresh element holding the multiplicative identity.
    pub fn new_int(&self) -> Int {
        Int {
            value: BigUint::one(),
            fingerprint: self.fingerprint,
        }
    }

    /// A fresh element holding `value mod p`.
    pub fn new_int_from_u64(&self, value: u64) -> Int {
        Int {
            value: BigUint::from(value) % &self.prime,
            fingerprint: self.fingerprint,
        }
    }

    /// Whether `value` is a member of `[1, p)`.
    pub fn inside(&self, value: &BigUint) -> bool {
        !value.is_zero() && value < &self.prime
    }

    /// Variadic membership check over canonical byte encodings.
    ///
    /// A payload with a leading zero byte is rejected: only canonical
    /// encodings round-trip through [`CyclicGroup::set_bytes`].
    pub fn bytes_inside(&self, payloads: &[&[u8]]) -> bool {
        payloads.iter().all(|p| self.one_inside(p))
    }

    fn one_inside(&self, payload: &[u8]) -> bool {
        if payload.is_empty() || payload[0] == 0 {
            return false;
        }
        self.inside(&BigUint::from_bytes_be(payload))
    }

    /// Decodes `bytes` into `dst`.
    ///
    /// # Errors
    /// Fails with [`GroupError::OutsideOfGroup`] when the decoded value is
    /// not in `[1, p)`, and with [`GroupError::FingerprintMismatch`] when
    /// `dst` belongs to another group.
    pub fn set_bytes(&self, dst: &mut Int, bytes: &[u8]) -> Result<(), GroupError> {
        self.check(dst)?;
        if !self.one_inside(bytes) {
            return Err(GroupError::OutsideOfGroup);
        }
        dst.value = BigUint::from_bytes_be(bytes);
        Ok(())
    }

    /// `out = a * b mod p`.
    pub fn mul(&self, a: &Int, b: &Int, out: &mut Int) -> Result<(), GroupError> {
        self.check(a)?;
        self.check(b)?;
        self.check(out)?;
        out.value = (&a.value * &b.value) % &self.prime;
        Ok(())
    }

    /// `out = base ^ exp mod p`.
    pub fn exp(&self, base: &Int, exp: &Int, out: &mut Int) -> Result<(), GroupError> {
        self.check(base)?;
        self.check(exp)?;
        self.check(out)?;
        out.value = base.value.modpow(&exp.value, &self.prime);
        Ok(())
    }

    /// `out = g ^ exp mod p` for an arbitrary exponent, used to map derived
    /// key material into the group.
    pub fn exp_generator(&self, exp: &BigUint, out: &mut Int) -> Result<(), GroupError> {
        self.check(out)?;
        out.value = self.generator.modpow(exp, &self.prime);
        Ok(())
    }

    /// `out = a ^ -1 mod p`, via Fermat's little theorem (`p` is prime).
    pub fn inverse(&self, a: &Int, out: &mut Int) -> Result<(), GroupError> {
        self.check(a)?;
        self.check(out)?;
        let exp = &self.psub1 - 1u8;
        out.value = a.value.modpow(&exp, &self.prime);
        Ok(())
    }

    /// `out = a ^ (z^-1 mod p-1) mod p`: the z-th root of `a`, defined when
    /// `z` is coprime to the group order.
    pub fn root_coprime(&self, a: &Int, z: &Int, out: &mut Int) -> Result<(), GroupError> {
        self.check(a)?;
        self.check(z)?;
        self.check(out)?;
        let zinv = mod_inverse(&z.value, &self.psub1).ok_or(GroupError::NotCoprime)?;
        out.value = a.value.modpow(&zinv, &self.prime);
        Ok(())
    }

    /// Samples `out` uniformly in `[1, p)`.
    pub fn random<R: Rng>(&self, out: &mut Int, rng: &mut R) -> Result<(), GroupError> {
        self.check(out)?;
        out.value = rng.gen_biguint_below(&self.psub1) + 1u8;
        Ok(())
    }

    /// Samples `out` uniformly among the elements of `[2, p)` coprime to
    /// the group order.
    pub fn random_coprime<R: Rng>(&self, out: &mut Int, rng: &mut R) -> Result<(), GroupError> {
        self.check(out)?;
        loop {
            let candidate = rng.gen_biguint_below(&self.psub1) + 1u8;
            if candidate > BigUint::one() && candidate.gcd(&self.psub1).is_one() {
                out.value = candidate;
                return Ok(());
            }
        }
    }

    /// Draws a small exponent of at most `bits` bits that is coprime to the
    /// group order and to `q`. Used to initialize a node's private cypher
    /// key `Z`.
    pub fn find_small_coprime_inverse<R: Rng>(
        &self,
        out: &mut Int,
        bits: u64,
        rng: &mut R,
    ) -> Result<(), GroupError> {
        self.check(out)?;
        loop {
            let candidate = rng.gen_biguint(bits);
            if candidate > BigUint::one()
                && candidate.gcd(&self.psub1).is_one()
                && candidate.gcd(&self.prime_q).is_one()
            {
                out.value = candidate;
                return Ok(());
            }
        }
    }

    fn check(&self, operand: &Int) -> Result<(), GroupError> {
        if operand.fingerprint != self.fingerprint {
            return Err(GroupError::FingerprintMismatch {
                group: self.fingerprint,
                operand: operand.fingerprint,
            });
        }
        Ok(())
    }
}

/// The modular inverse of `a` modulo `m`, or `None` when `gcd(a, m) != 1`.
fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(m.clone());
    let gcd = a.extended_gcd(&m);
    if !gcd.gcd.is_one() {
        return None;
    }
    let inv = ((gcd.x % &m) + &m) % &m;
    inv.to_biguint()
}

fn fingerprint(prime: &BigUint, generator: &BigUint, prime_q: &BigUint) -> u64 {
    let mut hasher = Sha256::new();
    for part in &[prime, generator, prime_q] {
        let bytes = part.to_bytes_be();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }
    let digest = hasher.finalize();
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(stamp)
}

fn biguint_from_hex(hex_str: &str) -> Result<BigUint, GroupError> {
    let padded = if hex_str.len() % 2 == 0 {
        hex_str.to_string()
    } else {
        format!("0{}", hex_str)
    };
    let bytes = hex::decode(&padded).map_err(|_| GroupError::InvalidEncoding)?;
    Ok(BigUint::from_bytes_be(&bytes))
}
