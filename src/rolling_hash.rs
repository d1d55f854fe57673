/// Adler32-style rolling hash for block matching.
///
/// Two 16-bit sums (a, b) combined into a 32-bit digest; sliding the window
/// by one byte is O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingHash {
    /// Hash an initial window.
    pub fn over(window: &[u8]) -> Self {
        // Accumulate in u64 so the modular reduction happens once per window, not per byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in window {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window_size: window.len() as u32,
        }
    }

    /// Slide the window: drop `outgoing` from the front, append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a
            - (out * (self.window_size % MOD_ADLER)) % MOD_ADLER)
            % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
