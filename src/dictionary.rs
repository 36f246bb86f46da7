//! A mapping between token strings and integer ids.
use std::collections::HashMap;

pub const BOS_TOKEN: &str = "<s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

/// A bidirectional token/id mapping with fixed special symbols.
///
/// The special symbols always occupy the first four ids: bos=0, pad=1,
/// eos=2, unk=3. A dictionary is built once at setup and shared immutably
/// (typically behind an `Arc`) by every component that needs vocabulary
/// sizes or special-id lookups.
#[derive(Debug, Clone)]
pub struct Dictionary {
    symbol_to_index: HashMap<String, i64>,
    symbols: Vec<String>,
}

impl Dictionary {
    pub fn new() -> Dictionary {
        let mut dict = Dictionary { symbol_to_index: HashMap::new(), symbols: vec![] };
        for token in [BOS_TOKEN, PAD_TOKEN, EOS_TOKEN, UNK_TOKEN] {
            dict.add_symbol(token);
        }
        dict
    }

    /// Adds a symbol, returning its id. Re-adding an existing symbol is a
    /// no-op returning the previously assigned id.
    pub fn add_symbol(&mut self, symbol: &str) -> i64 {
        match self.symbol_to_index.get(symbol) {
            Some(&index) => index,
            None => {
                let index = self.symbols.len() as i64;
                self.symbol_to_index.insert(symbol.to_string(), index);
                self.symbols.push(symbol.to_string());
                index
            }
        }
    }

    /// The id for `symbol`, falling back to the unknown id.
    pub fn index(&self, symbol: &str) -> i64 {
        self.symbol_to_index.get(symbol).copied().unwrap_or_else(|| self.unk())
    }

    pub fn symbol(&self, index: i64) -> Option<&str> {
        self.symbols.get(index as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> i64 {
        self.symbols.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn bos(&self) -> i64 {
        0
    }

    pub fn pad(&self) -> i64 {
        1
    }

    pub fn eos(&self) -> i64 {
        2
    }

    pub fn unk(&self) -> i64 {
        3
    }

    /// Builds a dictionary from an iterator of symbols, e.g. a token stream.
    pub fn from_symbols<I: IntoIterator<Item = S>, S: AsRef<str>>(symbols: I) -> Dictionary {
        let mut dict = Dictionary::new();
        for symbol in symbols {
            dict.add_symbol(symbol.as_ref());
        }
        dict
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Dictionary::new()
    }
}
