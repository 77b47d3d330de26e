//! ARPA text format. The venerable `\data\` header with per-order counts,
//! one section of log10 probabilities per order, and an `\end\` mark.
//! Probabilities are converted to natural logs on the way in and back to
//! log10 on the way out.
use crate::error::{Result, SttError};
use crate::lm::trie::RawNgram;
use crate::lm::RawLm;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use tracing::{error, warn};

const LN_10: f32 = std::f32::consts::LN_10;

/// Skip to `\data\` and read the `ngram k=N` lines.
fn read_counts(lines: &mut impl Iterator<Item = std::io::Result<String>>) -> Result<Vec<u32>> {
    let mut in_data = false;
    for line in lines.by_ref() {
        if line?.trim() == "\\data\\" {
            in_data = true;
            break;
        }
    }
    if !in_data {
        return Err(SttError::bad_format("arpa", "no \\data\\ mark in LM file"));
    }
    let mut counts = Vec::new();
    for line in lines.by_ref() {
        let line = line?;
        let line = line.trim();
        let Some(rest) = line.strip_prefix("ngram ") else {
            break;
        };
        let (k, n) = rest
            .split_once('=')
            .ok_or_else(|| SttError::bad_format("arpa", format!("bad count line {}", line)))?;
        let k: usize = k
            .trim()
            .parse()
            .map_err(|_| SttError::bad_format("arpa", "bad ngram order"))?;
        if k != counts.len() + 1 {
            return Err(SttError::bad_format(
                "arpa",
                format!("ngram counts out of order, {} after {}", k, counts.len()),
            ));
        }
        counts.push(
            n.trim()
                .parse()
                .map_err(|_| SttError::bad_format("arpa", "bad ngram count"))?,
        );
    }
    if counts.is_empty() {
        return Err(SttError::bad_format("arpa", "no ngram counts"));
    }
    Ok(counts)
}

pub fn read(rdr: impl BufRead) -> Result<RawLm> {
    let mut lines = rdr.lines();
    let counts = read_counts(&mut lines)?;
    let order = counts.len();

    // Unigram section.
    for line in lines.by_ref() {
        if line?.trim() == "\\1-grams:" {
            break;
        }
    }
    let mut word_str = Vec::with_capacity(counts[0] as usize);
    let mut unigrams = Vec::with_capacity(counts[0] as usize);
    let mut wid: HashMap<String, u32> = HashMap::new();
    while unigrams.len() < counts[0] as usize {
        let line = lines
            .next()
            .ok_or_else(|| SttError::bad_format("arpa", "unexpected end of unigrams"))??;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            if !line.trim().is_empty() {
                error!("Format error, failed to read unigram: {}", line);
            }
            continue;
        }
        let mut prob: f32 = parts[0]
            .parse()
            .map_err(|_| SttError::bad_format("arpa", "bad unigram probability"))?;
        if prob > 0.0 {
            warn!("Unigram '{}' has positive probability", parts[1]);
            prob = 0.0;
        }
        let bo: f32 = if parts.len() > 2 {
            parts[2].parse().unwrap_or(0.0)
        } else {
            0.0
        };
        if wid
            .insert(parts[1].to_string(), word_str.len() as u32)
            .is_some()
        {
            warn!("Duplicate word in dictionary: {}", parts[1]);
        }
        word_str.push(parts[1].to_string());
        unigrams.push((prob * LN_10, bo * LN_10));
    }

    // Higher order sections.
    let mut raw: Vec<Vec<RawNgram>> = Vec::new();
    for k in 2..=order {
        let header = format!("\\{}-grams:", k);
        let mut found = false;
        for line in lines.by_ref() {
            if line?.trim() == header {
                found = true;
                break;
            }
        }
        if !found {
            return Err(SttError::bad_format(
                "arpa",
                format!("'{}' missing, language model file truncated", header),
            ));
        }
        let mut level = Vec::with_capacity(counts[k - 1] as usize);
        while level.len() < counts[k - 1] as usize {
            let line = lines
                .next()
                .ok_or_else(|| SttError::bad_format("arpa", "unexpected end of ngrams"))??;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < k + 1 {
                if !line.trim().is_empty() {
                    error!("Format error, {}-gram ignored: {}", k, line);
                }
                continue;
            }
            let mut prob: f32 = parts[0]
                .parse()
                .map_err(|_| SttError::bad_format("arpa", "bad ngram probability"))?;
            if prob > 0.0 {
                warn!("{}-gram '{}' has positive probability", k, parts[1]);
                prob = 0.0;
            }
            let backoff: f32 = if k < order && parts.len() > k + 1 {
                parts[k + 1].parse().unwrap_or(0.0)
            } else {
                0.0
            };
            // Words arrive oldest-first; the trie wants predicted word first
            // then history in recency order, which is simply the reverse.
            let mut words = Vec::with_capacity(k);
            for w in parts[1..=k].iter().rev() {
                match wid.get(*w) {
                    Some(&id) => words.push(id),
                    None => {
                        return Err(SttError::UnknownSymbol(format!(
                            "{} in {}-gram section",
                            w, k
                        )))
                    }
                }
            }
            level.push(RawNgram {
                words,
                prob: prob * LN_10,
                backoff: backoff * LN_10,
            });
        }
        raw.push(level);
    }

    let mut saw_end = false;
    for line in lines {
        if line?.trim() == "\\end\\" {
            saw_end = true;
            break;
        }
    }
    if !saw_end {
        warn!("Finished reading ARPA file without an end mark");
    }

    Ok(RawLm {
        counts,
        word_str,
        unigrams,
        raw,
    })
}

/// Write an LM back out as ARPA text. `extract` yields ARPA-ordered raw
/// n-grams for each order 2..=order.
pub fn write(
    mut w: impl Write,
    counts: &[u32],
    word_str: &[String],
    unigrams: &[(f32, f32)],
    mut extract: impl FnMut(usize) -> Vec<RawNgram>,
) -> Result<()> {
    let order = counts.len();
    writeln!(w, "Generated by xd-stt")?;
    writeln!(w, "\\data\\")?;
    for (i, c) in counts.iter().enumerate() {
        writeln!(w, "ngram {}={}", i + 1, c)?;
    }
    writeln!(w)?;
    writeln!(w, "\\1-grams:")?;
    for (i, (prob, bo)) in unigrams.iter().enumerate() {
        if order > 1 {
            writeln!(
                w,
                "{:.4}\t{}\t{:.4}",
                prob / LN_10,
                word_str[i],
                bo / LN_10
            )?;
        } else {
            writeln!(w, "{:.4}\t{}", prob / LN_10, word_str[i])?;
        }
    }
    for k in 2..=order {
        let mut grams = extract(k);
        grams.sort_by(|a, b| a.words.cmp(&b.words));
        writeln!(w)?;
        writeln!(w, "\\{}-grams:", k)?;
        for g in &grams {
            write!(w, "{:.4}", g.prob / LN_10)?;
            for &word in &g.words {
                write!(w, "\t{}", word_str[word as usize])?;
            }
            if k < order {
                write!(w, "\t{:.4}", g.backoff / LN_10)?;
            }
            writeln!(w)?;
        }
    }
    writeln!(w)?;
    writeln!(w, "\\end\\")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    pub const TINY_ARPA: &str = "\
Some header text

\\data\\
ngram 1=5
ngram 2=4
ngram 3=2

\\1-grams:
-1.0000\t<s>\t-0.3010
-1.0000\t</s>
-0.6990\tGO\t-0.3010
-0.6990\tFORWARD\t-0.2218
-1.0000\tSTOP\t-0.3979

\\2-grams:
-0.3010\t<s>\tGO\t-0.3010
-0.3979\tGO\tFORWARD\t-0.3010
-0.6990\tFORWARD\t</s>
-0.6990\tGO\tSTOP

\\3-grams:
-0.1761\t<s>\tGO\tFORWARD
-0.3010\tGO\tFORWARD\t</s>

\\end\\
";

    #[test]
    fn parse_counts_and_words() {
        let data = read(Cursor::new(TINY_ARPA)).unwrap();
        assert_eq!(data.counts, vec![5, 4, 2]);
        assert_eq!(data.word_str.len(), 5);
        assert_eq!(data.word_str[2], "GO");
        assert!((data.unigrams[2].0 - (-0.6990 * LN_10)).abs() < 1e-4);
        assert_eq!(data.raw[0].len(), 4);
        assert_eq!(data.raw[1].len(), 2);
        // Trigram "<s> GO FORWARD" in trie order is [FORWARD, GO, <s>].
        assert_eq!(data.raw[1][0].words, vec![3, 2, 0]);
    }

    #[test]
    fn missing_data_mark_is_bad_format() {
        assert!(matches!(
            read(Cursor::new("hello\nworld\n")),
            Err(SttError::BadFormat { .. })
        ));
    }

    #[test]
    fn truncated_sections_error() {
        let text = "\\data\\\nngram 1=2\nngram 2=1\n\n\\1-grams:\n-1.0 a\n-1.0 b\n";
        assert!(read(Cursor::new(text)).is_err());
    }
}
