//! Title cleanup and slugs.

use scraper::Html;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Strips markup, decodes entities (named and numeric) and collapses whitespace.
pub fn clean_title(raw: &str) -> String {
    let text = if raw.contains(['<', '&']) {
        Html::parse_fragment(raw)
            .root_element()
            .text()
            .collect::<String>()
    } else {
        raw.to_string()
    };
    collapse_whitespace(&text)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cyrillic(c: char) -> Option<&'static str> {
    Some(match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'ё' | 'э' => "e",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' | 'ы' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "kh",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' | 'ь' => "",
        'ю' => "yu",
        'я' => "ya",
        'і' => "i",
        'ї' => "yi",
        'є' => "ye",
        _ => return None,
    })
}

/// Lowercase ASCII-ish slug: Cyrillic transliterated, accents dropped, other runs become `-`.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    let mut push = |piece: char, out: &mut String| {
        if piece.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(piece);
        } else {
            pending_dash = true;
        }
    };

    for c in title.chars().flat_map(char::to_lowercase) {
        if let Some(latin) = cyrillic(c) {
            latin.chars().for_each(|l| push(l, &mut out));
            continue;
        }
        for d in c.nfkd().filter(|d| !is_combining_mark(*d)) {
            for lower in d.to_lowercase() {
                push(lower, &mut out);
            }
        }
    }
    out
}
