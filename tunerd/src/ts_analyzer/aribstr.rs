//! ARIB STD-B24 8-unit character decoding.
//!
//! Handles G0-G3 designation, locking/single shifts, the character size
//! controls that switch between full and half width, and skips the other
//! C0/C1 presentation controls. Kanji is mapped through EUC-JP.

use encoding_rs::EUC_JP;

const ESC: u8 = 0x1B;
const GETA: char = '〓';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charset {
    Kanji,
    JisKanji1,
    JisKanji2,
    Symbols,
    Alnum,
    Hiragana,
    Katakana,
    JisKatakana,
    Mosaic,
    Drcs { two_byte: bool },
}

impl Charset {
    fn bytes(self) -> usize {
        match self {
            Charset::Kanji | Charset::JisKanji1 | Charset::JisKanji2 | Charset::Symbols => 2,
            Charset::Drcs { two_byte: true } => 2,
            _ => 1,
        }
    }

    fn from_one_byte_final(f: u8) -> Charset {
        match f {
            0x4A | 0x36 => Charset::Alnum,
            0x30 | 0x37 => Charset::Hiragana,
            0x31 | 0x38 => Charset::Katakana,
            0x49 => Charset::JisKatakana,
            0x32..=0x35 => Charset::Mosaic,
            _ => Charset::Alnum,
        }
    }

    fn from_two_byte_final(f: u8) -> Charset {
        match f {
            0x39 => Charset::JisKanji1,
            0x3A => Charset::JisKanji2,
            0x3B => Charset::Symbols,
            _ => Charset::Kanji,
        }
    }
}

/// Additional symbols (row 90, columns 0x50..=0x72).
const SYMBOLS_ROW90: [&str; 35] = [
    "【HV】", "【SD】", "【Ｐ】", "【Ｗ】", "【MV】", "【手】", "【字】", "【双】", "【デ】",
    "【Ｓ】", "【二】", "【多】", "【解】", "【SS】", "【Ｂ】", "【Ｎ】", "■", "●", "【天】",
    "【交】", "【映】", "【無】", "【料】", "【年齢制限】", "【前】", "【後】", "【再】", "【新】",
    "【初】", "【終】", "【生】", "【販】", "【声】", "【吹】", "【PPV】",
];

const KANA_TAIL_HIRAGANA: [char; 8] = ['ゝ', 'ゞ', 'ー', '。', '「', '」', '、', '・'];
const KANA_TAIL_KATAKANA: [char; 8] = ['ヽ', 'ヾ', 'ー', '。', '「', '」', '、', '・'];

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    g: [Charset; 4],
    gl: usize,
    gr: usize,
    half_width: bool,
    out: String,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            g: [
                Charset::Kanji,
                Charset::Alnum,
                Charset::Hiragana,
                Charset::Katakana,
            ],
            gl: 0,
            gr: 2,
            half_width: false,
            out: String::with_capacity(data.len() * 2),
        }
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied();
        self.pos += 1;
        b
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn run(mut self) -> String {
        while let Some(b) = self.next() {
            match b {
                0x0D => self.out.push('\n'),
                0x0E => self.gl = 1,
                0x0F => self.gl = 0,
                0x16 => self.skip(1),
                0x19 => self.single_shift(2),
                0x1C => self.skip(2),
                0x1D => self.single_shift(3),
                ESC => self.escape(),
                0x20 => self.out.push(if self.half_width { ' ' } else { '\u{3000}' }),
                0x21..=0x7E => self.graphic(self.g[self.gl], b),
                0x88 | 0x89 => self.half_width = true,
                0x8A => self.half_width = false,
                0x8B | 0x91 | 0x93 | 0x94 | 0x97 | 0x98 => self.skip(1),
                0x90 | 0x92 => {
                    if self.peek() == Some(0x20) {
                        self.skip(2);
                    } else {
                        self.skip(1);
                    }
                }
                0x95 => self.skip_macro(),
                0x9B => self.skip_csi(),
                0x9D => self.skip(2),
                0xA1..=0xFE => self.graphic(self.g[self.gr], b & 0x7F),
                _ => {}
            }
        }
        self.out
    }

    fn single_shift(&mut self, set: usize) {
        if let Some(b) = self.next() {
            if (0x21..=0x7E).contains(&b) {
                self.graphic(self.g[set], b);
            }
        }
    }

    fn escape(&mut self) {
        let Some(b) = self.next() else { return };
        match b {
            0x6E => self.gl = 2,
            0x6F => self.gl = 3,
            0x7E => self.gr = 1,
            0x7D => self.gr = 2,
            0x7C => self.gr = 3,
            0x28..=0x2B => {
                let idx = (b - 0x28) as usize;
                match self.next() {
                    Some(0x20) => {
                        self.next();
                        self.g[idx] = Charset::Drcs { two_byte: false };
                    }
                    Some(f) => self.g[idx] = Charset::from_one_byte_final(f),
                    None => {}
                }
            }
            0x24 => match self.next() {
                Some(i @ 0x28..=0x2B) => {
                    let idx = (i - 0x28) as usize;
                    match self.next() {
                        Some(0x20) => {
                            self.next();
                            self.g[idx] = Charset::Drcs { two_byte: true };
                        }
                        Some(f) => self.g[idx] = Charset::from_two_byte_final(f),
                        None => {}
                    }
                }
                Some(f) => self.g[0] = Charset::from_two_byte_final(f),
                None => {}
            },
            _ => {}
        }
    }

    fn skip_macro(&mut self) {
        // MACRO definitions run until MACRO 0x4F.
        while let Some(b) = self.next() {
            if b == 0x95 && self.peek() == Some(0x4F) {
                self.skip(1);
                return;
            }
        }
    }

    fn skip_csi(&mut self) {
        while let Some(b) = self.next() {
            if b == 0x20 {
                self.skip(1);
                return;
            }
        }
    }

    fn graphic(&mut self, charset: Charset, b1: u8) {
        if charset.bytes() == 2 {
            let Some(b2) = self.next() else { return };
            let b2 = b2 & 0x7F;
            self.two_byte(charset, b1, b2);
            return;
        }
        match charset {
            Charset::Alnum => self.out.push(alnum(b1, self.half_width)),
            Charset::Hiragana => self.out.push(kana(b1, 0x3041, 0x73, &KANA_TAIL_HIRAGANA)),
            Charset::Katakana => self.out.push(kana(b1, 0x30A1, 0x76, &KANA_TAIL_KATAKANA)),
            Charset::JisKatakana => {
                if let Some(c) = char::from_u32(0xFF61 + (b1 as u32 - 0x21)) {
                    self.out.push(c);
                }
            }
            Charset::Drcs { .. } => self.out.push(GETA),
            _ => {}
        }
    }

    fn two_byte(&mut self, charset: Charset, b1: u8, b2: u8) {
        match charset {
            Charset::Drcs { .. } => self.out.push(GETA),
            Charset::JisKanji2 => self.out.push(GETA),
            _ if charset == Charset::Symbols || b1 >= 0x7A => {
                if b1 == 0x7A && (0x50..=0x72).contains(&b2) {
                    self.out.push_str(SYMBOLS_ROW90[(b2 - 0x50) as usize]);
                } else {
                    self.out.push(GETA);
                }
            }
            _ => {
                let bytes = [b1 | 0x80, b2 | 0x80];
                let (s, had_errors) = EUC_JP.decode_without_bom_handling(&bytes);
                if had_errors {
                    self.out.push(GETA);
                } else {
                    self.out.push_str(&s);
                }
            }
        }
    }
}

fn alnum(b: u8, half_width: bool) -> char {
    if half_width {
        match b {
            0x5C => '¥',
            0x7E => '‾',
            _ => b as char,
        }
    } else {
        match b {
            0x5C => '￥',
            0x7E => '￣',
            _ => char::from_u32(0xFF01 + (b as u32 - 0x21)).unwrap_or(GETA),
        }
    }
}

fn kana(b: u8, base: u32, last: u8, tail: &[char; 8]) -> char {
    if b <= last {
        char::from_u32(base + (b as u32 - 0x21)).unwrap_or(GETA)
    } else if b >= 0x77 {
        tail[(b - 0x77) as usize]
    } else {
        '\u{3000}'
    }
}

/// Decode an ARIB STD-B24 8-unit coded string into UTF-8.
pub fn decode_arib_string(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    Decoder::new(data).run()
}
