/*!
 * Word-cloud generation engine.
 *
 * Turns a weighted word list plus a mask image into a rendered cloud:
 * fontdue measures and rasterizes words into packed bitmap sprites, a
 * bit-grid tracks occupancy (pre-seeded from the mask), placement walks a
 * rectangular spiral out from the image center, and the final image is
 * composed as SVG and rendered with resvg.
 */

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use fontdue::{Font, FontSettings};
use image::DynamicImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error as ThisError;
use tiny_skia::{Pixmap, Transform};
use tracing::debug;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Font error: {0}")]
    Font(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SVG error: {0}")]
    Svg(String),
    #[error("Render error: {0}")]
    Render(String),
    #[error("Invalid input: {0}")]
    Input(String),
}

// =============================================================================
// Word Frequencies
// =============================================================================

/// English stopwords excluded from frequency counting.
static STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am",
    "an", "and", "any", "are", "aren't", "as", "at", "be", "because", "been",
    "before", "being", "below", "between", "both", "but", "by", "can",
    "can't", "cannot", "com", "could", "couldn't", "did", "didn't", "do",
    "does", "doesn't", "doing", "don't", "down", "during", "each", "else",
    "ever", "few", "for", "from", "further", "get", "had", "hadn't", "has",
    "hasn't", "have", "haven't", "having", "he", "he'd", "he'll", "he's",
    "hence", "her", "here", "here's", "hers", "herself", "him", "himself",
    "his", "how", "how's", "however", "http", "i", "i'd", "i'll", "i'm",
    "i've", "if", "in", "into", "is", "isn't", "it", "it's", "its", "itself",
    "just", "let's", "like", "me", "more", "most", "mustn't", "my", "myself",
    "no", "nor", "not", "of", "off", "on", "once", "only", "or", "other",
    "otherwise", "ought", "our", "ours", "ourselves", "out", "over", "own",
    "same", "shall", "shan't", "she", "she'd", "she'll", "she's", "should",
    "shouldn't", "since", "so", "some", "such", "than", "that", "that's",
    "the", "their", "theirs", "them", "themselves", "then", "there",
    "there's", "therefore", "these", "they", "they'd", "they'll", "they're",
    "they've", "this", "those", "through", "to", "too", "under", "until",
    "up", "very", "was", "wasn't", "we", "we'd", "we'll", "we're", "we've",
    "were", "weren't", "what", "what's", "when", "when's", "where",
    "where's", "which", "while", "who", "who's", "whom", "why", "why's",
    "with", "won't", "would", "wouldn't", "www", "you", "you'd", "you'll",
    "you're", "you've", "your", "yours", "yourself", "yourselves",
];

/// Tokenization knobs for [`word_frequencies`].
#[derive(Debug, Clone)]
pub struct TokenizeOptions {
    /// Tokens shorter than this many characters are dropped.
    pub min_word_length: usize,
}

impl Default for TokenizeOptions {
    fn default() -> Self {
        Self { min_word_length: 3 }
    }
}

/// Splits `text` into word tokens: maximal runs of alphanumeric characters
/// with embedded apostrophes. A token cannot start with an apostrophe.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, ch) in text.char_indices() {
        if ch.is_alphanumeric() || (ch == '\'' && start.is_some()) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            tokens.push(&text[s..i]);
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    tokens
}

/// Counts word occurrences in `text`.
///
/// Tokens are lowercased and possessive `'s` suffixes stripped; purely
/// numeric tokens, short tokens and stopwords are dropped. Plural forms are
/// folded into their singular when the singular also occurs. The result is
/// sorted by count descending (ties alphabetical, for determinism).
pub fn word_frequencies(text: &str, opts: &TokenizeOptions) -> Vec<(String, f32)> {
    let mut counts: HashMap<String, u32> = HashMap::new();

    for raw in tokenize(text) {
        let mut word = raw.to_lowercase();
        if let Some(stripped) = word.strip_suffix("'s") {
            let len = stripped.len();
            word.truncate(len);
        }
        if word.chars().all(|c| c.is_numeric()) {
            continue;
        }
        if word.chars().count() < opts.min_word_length {
            continue;
        }
        if STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        *counts.entry(word).or_insert(0) += 1;
    }

    // Fold "words" into "word" when both occur.
    let plurals: Vec<String> = counts
        .keys()
        .filter(|w| w.ends_with('s') && counts.contains_key(&w[..w.len() - 1]))
        .cloned()
        .collect();
    for plural in plurals {
        if let Some(n) = counts.remove(&plural) {
            let singular = plural[..plural.len() - 1].to_string();
            *counts.entry(singular).or_insert(0) += n;
        }
    }

    let mut out: Vec<(String, f32)> = counts
        .into_iter()
        .map(|(word, n)| (word, n as f32))
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

// =============================================================================
// Colormap
// =============================================================================

/// Green-shade colormap: three independent piecewise channel functions over
/// a nominal t in [0, 1]. Inputs and outputs are deliberately not clamped;
/// out-of-range values pass through the arithmetic unchanged.
pub fn green_shades(t: f32) -> (f32, f32, f32) {
    let r = if t < 0.75 { 0.6 * (0.75 - t) } else { 0.0 };
    let g = if t > 0.5 {
        1.0 - 0.4 * (t - 0.5) * (t - 0.5)
    } else {
        1.0
    };
    let b = if t > 0.5 { 0.5 * (t - 0.5) } else { 0.0 };
    (r, g, b)
}

/// Channel triple to an SVG hex color. The f32 -> u8 conversion saturates.
pub fn rgb_to_hex(r: f32, g: f32, b: f32) -> String {
    let to_byte = |v: f32| (v * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

// =============================================================================
// Mask
// =============================================================================

/// Per-pixel placement mask derived from an image: 255 where text is
/// forbidden, 0 where it may be placed. A pixel is forbidden exactly when
/// the product of its three channels is zero. Same dimensions as the source
/// image; never resized or normalized.
#[derive(Debug)]
pub struct Mask {
    width: u32,
    height: u32,
    cells: Vec<u8>,
}

impl Mask {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let img = image::open(path)?;
        Ok(Self::from_image(&img))
    }

    pub fn from_image(img: &DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        let cells = rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                if r as u32 * g as u32 * b as u32 == 0 {
                    255
                } else {
                    0
                }
            })
            .collect();
        Self {
            width: rgb.width(),
            height: rgb.height(),
            cells,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_blocked(&self, x: u32, y: u32) -> bool {
        self.cells[(y * self.width + x) as usize] == 255
    }

    /// Row-major 0/255 grid, one byte per pixel.
    pub fn as_bytes(&self) -> &[u8] {
        &self.cells
    }
}

// =============================================================================
// Font Loading
// =============================================================================

struct FontInfo {
    data: Vec<u8>,
    family_name: String,
    collection_index: u32,
}

impl FontInfo {
    /// Locates the system sans-serif face. The same bytes feed fontdue for
    /// measurement and resvg for rendering, so the two agree on metrics.
    fn system_sans() -> Result<Self, Error> {
        let mut db = usvg::fontdb::Database::new();
        db.load_system_fonts();
        let query = usvg::fontdb::Query {
            families: &[usvg::fontdb::Family::SansSerif],
            ..usvg::fontdb::Query::default()
        };
        let id = db
            .query(&query)
            .ok_or_else(|| Error::Font("no sans-serif font installed".into()))?;
        let face = db
            .face(id)
            .ok_or_else(|| Error::Font("queried font face missing from database".into()))?;
        let family_name = face
            .families
            .first()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "sans-serif".to_string());
        let collection_index = face.index;
        let data = db
            .with_face_data(id, |bytes, _| bytes.to_vec())
            .ok_or_else(|| Error::Font("could not read font data".into()))?;
        debug!(family = %family_name, "system font selected");
        Ok(Self {
            data,
            family_name,
            collection_index,
        })
    }

    fn from_bytes(data: Vec<u8>) -> Result<Self, Error> {
        let mut db = usvg::fontdb::Database::new();
        db.load_font_source(usvg::fontdb::Source::Binary(Arc::new(data.clone())));
        let family_name = db
            .faces()
            .next()
            .and_then(|face| face.families.first().map(|(name, _)| name.clone()))
            .ok_or_else(|| Error::Font("font data contains no usable face".into()))?;
        Ok(Self {
            data,
            family_name,
            collection_index: 0,
        })
    }
}

// =============================================================================
// Occupancy Grid
// =============================================================================

/// Bit-packed occupancy grid, one bit per pixel, u64 blocks, LSB-first
/// within a block. Set bits mark pixels unavailable for text.
struct Occupancy {
    width: u32,
    height: u32,
    stride: usize, // u64 blocks per row
    bits: Vec<u64>,
}

impl Occupancy {
    fn new(width: u32, height: u32) -> Self {
        let stride = (width as usize + 63) >> 6;
        Self {
            width,
            height,
            stride,
            bits: vec![0; stride * height as usize],
        }
    }

    /// Grid with every forbidden mask pixel pre-set.
    fn from_mask(mask: &Mask) -> Self {
        let mut grid = Self::new(mask.width(), mask.height());
        for y in 0..mask.height() {
            for x in 0..mask.width() {
                if mask.is_blocked(x, y) {
                    grid.block(x, y);
                }
            }
        }
        grid
    }

    fn block(&mut self, x: u32, y: u32) {
        let row = y as usize * self.stride;
        self.bits[row + (x as usize >> 6)] |= 1u64 << (x & 63);
    }

    #[cfg(test)]
    fn is_blocked(&self, x: u32, y: u32) -> bool {
        self.bits[y as usize * self.stride + (x as usize >> 6)] & (1u64 << (x & 63)) != 0
    }

    /// Whether the sprite placed with its top-left corner at (x, y) overlaps
    /// any set bit. The caller guarantees the sprite lies fully inside the
    /// grid; each sprite row is shifted into grid alignment block by block.
    fn collides(&self, sprite: &WordSprite, x: u32, y: u32) -> bool {
        let shift = x & 63;
        let block0 = x as usize >> 6;
        for sy in 0..sprite.height as usize {
            let row = (y as usize + sy) * self.stride;
            let src = sprite.row(sy);
            let mut carry = 0u64;
            for (j, &b) in src.iter().enumerate() {
                let merged = if shift == 0 { b } else { (b << shift) | carry };
                if merged != 0 && self.bits[row + block0 + j] & merged != 0 {
                    return true;
                }
                carry = if shift == 0 { 0 } else { b >> (64 - shift) };
            }
            if carry != 0 && self.bits[row + block0 + src.len()] & carry != 0 {
                return true;
            }
        }
        false
    }

    /// Sets every sprite bit into the grid at (x, y). Same walk as
    /// [`Self::collides`], with OR instead of test.
    fn stamp(&mut self, sprite: &WordSprite, x: u32, y: u32) {
        let shift = x & 63;
        let block0 = x as usize >> 6;
        for sy in 0..sprite.height as usize {
            let row = (y as usize + sy) * self.stride;
            let src = sprite.row(sy);
            let mut carry = 0u64;
            for (j, &b) in src.iter().enumerate() {
                let merged = if shift == 0 { b } else { (b << shift) | carry };
                self.bits[row + block0 + j] |= merged;
                carry = if shift == 0 { 0 } else { b >> (64 - shift) };
            }
            if carry != 0 {
                self.bits[row + block0 + src.len()] |= carry;
            }
        }
    }
}

// =============================================================================
// Word Sprites
// =============================================================================

/// A rasterized word as a packed bitmap, dilated by the layout margin.
/// `anchor_x`/`anchor_y` locate the text baseline origin relative to the
/// sprite's top-left corner, for positioning the SVG `<text>` element.
struct WordSprite {
    width: u32,
    height: u32,
    stride: usize, // u64 blocks per row
    bits: Vec<u64>,
    anchor_x: f32,
    anchor_y: f32,
}

impl WordSprite {
    fn row(&self, sy: usize) -> &[u64] {
        &self.bits[sy * self.stride..(sy + 1) * self.stride]
    }
}

/// Rasterizes `text` at `px` into a sprite. Glyph coverage above a small
/// threshold sets bits, dilated by `margin` in every direction so placed
/// words keep their distance. Vertical sprites are the horizontal raster
/// rotated 90 degrees clockwise.
fn rasterize_word(text: &str, px: f32, vertical: bool, font: &Font, margin: u32) -> WordSprite {
    let line = font
        .horizontal_line_metrics(px)
        .unwrap_or(fontdue::LineMetrics {
            ascent: px * 0.8,
            descent: px * -0.2,
            line_gap: 0.0,
            new_line_size: px,
        });

    let mut glyphs = Vec::new();
    let mut advance = 0.0f32;
    for ch in text.chars() {
        let (metrics, coverage) = font.rasterize(ch, px);
        glyphs.push((advance, metrics, coverage));
        advance += metrics.advance_width;
    }

    let w = (advance.ceil() as u32 + 2 * margin).max(1);
    let h = (line.new_line_size.ceil() as u32 + 2 * margin).max(1);
    let base_x = margin as f32;
    let base_y = margin as f32 + line.ascent;

    let mut grid = vec![false; (w as usize) * (h as usize)];
    let pad = margin as i64;
    for (pen, metrics, coverage) in &glyphs {
        let left = base_x + pen + metrics.xmin as f32;
        let top = base_y - metrics.height as f32 - metrics.ymin as f32;
        for gy in 0..metrics.height {
            for gx in 0..metrics.width {
                if coverage[gy * metrics.width + gx] <= 10 {
                    continue;
                }
                let cx = (left + gx as f32).round() as i64;
                let cy = (top + gy as f32).round() as i64;
                for dy in -pad..=pad {
                    for dx in -pad..=pad {
                        let (fx, fy) = (cx + dx, cy + dy);
                        if fx >= 0 && fy >= 0 && fx < w as i64 && fy < h as i64 {
                            grid[fy as usize * w as usize + fx as usize] = true;
                        }
                    }
                }
            }
        }
    }

    // Rotate clockwise for vertical text: dst(x, y) = src(y, H - 1 - x).
    let (out_w, out_h, anchor_x, anchor_y) = if vertical {
        (h, w, h as f32 - base_y, base_x)
    } else {
        (w, h, base_x, base_y)
    };

    let stride = (out_w as usize + 63) >> 6;
    let mut bits = vec![0u64; stride * out_h as usize];
    for y in 0..out_h as usize {
        for x in 0..out_w as usize {
            let set = if vertical {
                grid[(h as usize - 1 - x) * w as usize + y]
            } else {
                grid[y * w as usize + x]
            };
            if set {
                bits[y * stride + (x >> 6)] |= 1u64 << (x & 63);
            }
        }
    }

    WordSprite {
        width: out_w,
        height: out_h,
        stride,
        bits,
        anchor_x,
        anchor_y,
    }
}

// =============================================================================
// Placement Spiral
// =============================================================================

/// Rectangular spiral of integer offsets around the origin, arm lengths
/// scaled to the image aspect ratio so coverage grows evenly.
struct RectSpiral {
    t: i64,
    step: i64,
    x: f64,
    y: f64,
    dx: f64,
    dy: f64,
}

impl RectSpiral {
    fn new(width: u32, height: u32, direction: i64) -> Self {
        let dy = 4.0;
        let dx = dy * width as f64 / height as f64;
        Self {
            t: 0,
            step: direction,
            x: 0.0,
            y: 0.0,
            dx,
            dy,
        }
    }
}

impl Iterator for RectSpiral {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        self.t += self.step;
        let sign = if self.t < 0 { -1.0 } else { 1.0 };
        let arm = ((1.0 + 4.0 * sign * self.t as f64).sqrt() - sign) as i64 & 3;
        match arm {
            0 => self.x += self.dx,
            1 => self.y += self.dy,
            2 => self.x -= self.dx,
            _ => self.y -= self.dy,
        }
        Some((self.x as i64, self.y as i64))
    }
}

const MAX_PLACEMENT_STEPS: usize = 10_000;

/// Walks the spiral out from the image center until the sprite fits without
/// collision. Offsets that put the sprite outside the image are skipped.
fn find_position(
    sprite: &WordSprite,
    grid: &Occupancy,
    rng: &mut ChaCha8Rng,
) -> Option<(u32, u32)> {
    if sprite.width > grid.width || sprite.height > grid.height {
        return None;
    }
    let cx = (grid.width - sprite.width) as i64 / 2;
    let cy = (grid.height - sprite.height) as i64 / 2;
    let direction = if rng.random_bool(0.5) { 1 } else { -1 };
    let spiral = RectSpiral::new(grid.width, grid.height, direction);

    for (dx, dy) in std::iter::once((0, 0)).chain(spiral.take(MAX_PLACEMENT_STEPS)) {
        let x = cx + dx;
        let y = cy + dy;
        if x < 0
            || y < 0
            || x + sprite.width as i64 > grid.width as i64
            || y + sprite.height as i64 > grid.height as i64
        {
            continue;
        }
        if !grid.collides(sprite, x as u32, y as u32) {
            return Some((x as u32, y as u32));
        }
    }
    None
}

// =============================================================================
// Public Data Types
// =============================================================================

/// A word with its weight (frequency count).
#[derive(Debug, Clone)]
pub struct WordInput {
    pub text: String,
    pub weight: f32,
}

impl WordInput {
    pub fn new(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight: weight.max(0.0),
        }
    }
}

/// A word the layout managed to place.
#[derive(Debug, Clone)]
pub struct PlacedWord {
    pub text: String,
    pub font_size: f32,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub color: String,
}

// =============================================================================
// Builder
// =============================================================================

pub struct WordCloudBuilder {
    width: u32,
    height: u32,
    background: String,
    colormap: fn(f32) -> (f32, f32, f32),
    font_data: Option<Vec<u8>>,
    mask: Option<Mask>,
    margin: u32,
    min_font_size: f32,
    max_font_size: f32,
    font_step: f32,
    relative_scaling: f32,
    prefer_horizontal: f32,
    max_words: usize,
    seed: Option<u64>,
}

impl Default for WordCloudBuilder {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            background: "#000000".into(),
            colormap: green_shades,
            font_data: None,
            mask: None,
            margin: 2,
            min_font_size: 4.0,
            max_font_size: 200.0,
            font_step: 1.0,
            relative_scaling: 0.5,
            prefer_horizontal: 0.9,
            max_words: 200,
            seed: None,
        }
    }
}

impl WordCloudBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    pub fn background(mut self, color: impl Into<String>) -> Self {
        self.background = color.into();
        self
    }

    /// Color function sampled at each placed word's normalized frequency.
    pub fn colormap(mut self, colormap: fn(f32) -> (f32, f32, f32)) -> Self {
        self.colormap = colormap;
        self
    }

    pub fn font(mut self, font_data: Vec<u8>) -> Self {
        self.font_data = Some(font_data);
        self
    }

    /// The mask also fixes the output dimensions.
    pub fn mask(mut self, mask: Mask) -> Self {
        self.width = mask.width().max(1);
        self.height = mask.height().max(1);
        self.mask = Some(mask);
        self
    }

    pub fn margin(mut self, margin: u32) -> Self {
        self.margin = margin;
        self
    }

    pub fn font_size_range(mut self, min: f32, max: f32) -> Self {
        self.min_font_size = min.max(1.0);
        self.max_font_size = max.max(self.min_font_size);
        self
    }

    pub fn max_font_size(mut self, max: f32) -> Self {
        self.max_font_size = max.max(self.min_font_size);
        self
    }

    /// Importance of frequency over rank when sizing words: 0 sizes purely
    /// by rank, 1 purely by frequency ratio.
    pub fn relative_scaling(mut self, rs: f32) -> Self {
        self.relative_scaling = rs.clamp(0.0, 1.0);
        self
    }

    /// Probability of a word being laid out horizontally (the rest are
    /// rotated 90 degrees).
    pub fn prefer_horizontal(mut self, p: f32) -> Self {
        self.prefer_horizontal = p.clamp(0.0, 1.0);
        self
    }

    pub fn max_words(mut self, n: usize) -> Self {
        self.max_words = n.max(1);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self, words: &[WordInput]) -> Result<WordCloud, Error> {
        if words.is_empty() {
            return Err(Error::Input("word list is empty".into()));
        }
        let mut sorted: Vec<_> = words
            .iter()
            .filter(|w| !w.text.trim().is_empty() && w.weight > 0.0)
            .cloned()
            .collect();
        if sorted.is_empty() {
            return Err(Error::Input("no usable words".into()));
        }
        sorted.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(self.max_words);

        let font_info = match self.font_data {
            Some(ref data) => FontInfo::from_bytes(data.clone())?,
            None => FontInfo::system_sans()?,
        };
        let font = Font::from_bytes(
            font_info.data.as_slice(),
            FontSettings {
                collection_index: font_info.collection_index,
                ..FontSettings::default()
            },
        )
        .map_err(|e| Error::Font(e.to_string()))?;

        let mut grid = match &self.mask {
            Some(mask) => Occupancy::from_mask(mask),
            None => Occupancy::new(self.width, self.height),
        };

        let mut rng = match self.seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_os_rng(),
        };

        let max_weight = sorted[0].weight;
        let mut placed = Vec::with_capacity(sorted.len());
        let mut font_size = self.max_font_size.min(self.height as f32);
        let mut last_freq = 1.0f32;

        for word in &sorted {
            let freq = word.weight / max_weight;

            // Size chain: each word scales off the previous word's fitted
            // size, mixing frequency ratio and rank by relative_scaling.
            if self.relative_scaling > 0.0 {
                font_size = ((self.relative_scaling * (freq / last_freq)
                    + (1.0 - self.relative_scaling))
                    * font_size)
                    .round();
            }

            let vertical = !rng.random_bool(self.prefer_horizontal as f64);

            let mut size = font_size;
            let mut spot = None;
            while size >= self.min_font_size {
                let sprite = rasterize_word(&word.text, size, vertical, &font, self.margin);
                if let Some((x, y)) = find_position(&sprite, &grid, &mut rng) {
                    spot = Some((sprite, x, y));
                    break;
                }
                size -= self.font_step;
            }
            let Some((sprite, x, y)) = spot else {
                // Out of room even at the minimum size: stop placing.
                debug!(word = %word.text, "no space left, stopping layout");
                break;
            };

            grid.stamp(&sprite, x, y);
            font_size = size;
            last_freq = freq;

            let (r, g, b) = (self.colormap)(freq);
            debug!(word = %word.text, size, x, y, vertical, "placed");
            placed.push(PlacedWord {
                text: word.text.clone(),
                font_size: size,
                x: x as f32 + sprite.anchor_x,
                y: y as f32 + sprite.anchor_y,
                rotation: if vertical { 90.0 } else { 0.0 },
                color: rgb_to_hex(r, g, b),
            });
        }

        if placed.is_empty() {
            return Err(Error::Render("could not place any words".into()));
        }
        debug!(placed = placed.len(), of = sorted.len(), "layout finished");

        Ok(WordCloud {
            width: self.width,
            height: self.height,
            background: self.background,
            words: placed,
            font_data: font_info.data,
            font_family: font_info.family_name,
        })
    }
}

// =============================================================================
// Output Generation
// =============================================================================

#[derive(Debug)]
pub struct WordCloud {
    pub width: u32,
    pub height: u32,
    pub background: String,
    pub words: Vec<PlacedWord>,
    font_data: Vec<u8>,
    font_family: String,
}

impl WordCloud {
    pub fn to_svg(&self) -> String {
        let mut svg = String::with_capacity(8192);

        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"#,
            self.width, self.height, self.width, self.height
        ));

        svg.push_str(&format!(
            r#"<rect width="100%" height="100%" fill="{}"/>"#,
            self.background
        ));

        svg.push_str(&format!(
            r#"<style>text{{font-family:'{}',sans-serif}}</style>"#,
            escape_xml(&self.font_family)
        ));

        for word in &self.words {
            if word.rotation != 0.0 {
                svg.push_str(&format!(
                    r#"<text x="{:.1}" y="{:.1}" fill="{}" font-size="{:.1}" transform="rotate({:.1} {:.1} {:.1})">{}</text>"#,
                    word.x,
                    word.y,
                    word.color,
                    word.font_size,
                    word.rotation,
                    word.x,
                    word.y,
                    escape_xml(&word.text)
                ));
            } else {
                svg.push_str(&format!(
                    r#"<text x="{:.1}" y="{:.1}" fill="{}" font-size="{:.1}">{}</text>"#,
                    word.x,
                    word.y,
                    word.color,
                    word.font_size,
                    escape_xml(&word.text)
                ));
            }
        }

        svg.push_str("</svg>");
        svg
    }

    pub fn to_png(&self, scale: f32) -> Result<Vec<u8>, Error> {
        let svg_content = self.to_svg();

        let mut fontdb = usvg::fontdb::Database::new();
        fontdb.load_font_source(usvg::fontdb::Source::Binary(Arc::new(
            self.font_data.clone(),
        )));
        debug!(family = %self.font_family, faces = fontdb.len(), "rendering SVG");

        let options = usvg::Options {
            font_family: self.font_family.clone(),
            fontdb: Arc::new(fontdb),
            ..usvg::Options::default()
        };

        let tree =
            usvg::Tree::from_str(&svg_content, &options).map_err(|e| Error::Svg(e.to_string()))?;
        let size = tree.size().to_int_size();
        let out_width = ((size.width() as f32 * scale).max(1.0)) as u32;
        let out_height = ((size.height() as f32 * scale).max(1.0)) as u32;

        let mut pixmap = Pixmap::new(out_width, out_height)
            .ok_or_else(|| Error::Render("failed to create pixel buffer".into()))?;

        if let Some(color) = parse_hex_color(&self.background) {
            pixmap.fill(color);
        }

        let transform = Transform::from_scale(scale, scale);
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        pixmap
            .encode_png()
            .map_err(|e| Error::Render(e.to_string()))
    }
}

fn parse_hex_color(hex: &str) -> Option<tiny_skia::Color> {
    let hex = hex.trim_start_matches('#');
    if hex.len() == 6 {
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(tiny_skia::Color::from_rgba8(r, g, b, 255))
    } else {
        None
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn mask_flags_pixels_with_a_zero_channel() {
        let img = RgbImage::from_fn(4, 2, |x, y| match (x, y) {
            (0, 0) => image::Rgb([0, 0, 0]),       // all zero
            (1, 0) => image::Rgb([255, 0, 255]),   // one zero channel
            (2, 0) => image::Rgb([10, 10, 10]),    // all nonzero
            (3, 0) => image::Rgb([255, 255, 255]), // white
            _ => image::Rgb([1, 2, 3]),
        });
        let mask = Mask::from_image(&DynamicImage::ImageRgb8(img));
        assert_eq!(mask.width(), 4);
        assert_eq!(mask.height(), 2);
        assert_eq!(mask.as_bytes()[0], 255);
        assert_eq!(mask.as_bytes()[1], 255);
        assert_eq!(mask.as_bytes()[2], 0);
        assert_eq!(mask.as_bytes()[3], 0);
        assert!(mask.is_blocked(1, 0));
        assert!(!mask.is_blocked(2, 0));
        assert!(!mask.is_blocked(0, 1));
    }

    #[test]
    fn gradient_reference_values() {
        let (r, g, b) = green_shades(0.5);
        assert!(close(r, 0.15) && close(g, 1.0) && close(b, 0.0));

        let (r, g, b) = green_shades(1.0);
        assert!(close(r, 0.0) && close(g, 0.9) && close(b, 0.25));

        let (r, g, b) = green_shades(0.0);
        assert!(close(r, 0.45) && close(g, 1.0) && close(b, 0.0));
    }

    #[test]
    fn gradient_is_not_clamped() {
        // t outside [0, 1] passes straight through the arithmetic.
        let (r, _, _) = green_shades(-1.0);
        assert!(close(r, 0.6 * 1.75));
        let (_, g, b) = green_shades(2.0);
        assert!(close(g, 1.0 - 0.4 * 2.25));
        assert!(close(b, 0.75));
    }

    #[test]
    fn hex_conversion_saturates() {
        assert_eq!(rgb_to_hex(0.0, 1.0, 0.0), "#00ff00");
        assert_eq!(rgb_to_hex(1.05, -0.2, 0.5), "#ff0080");
    }

    #[test]
    fn tokenizer_splits_on_non_word_characters() {
        let tokens = tokenize("Hello, world! Rust's memory-safety (2024)");
        assert_eq!(
            tokens,
            vec!["Hello", "world", "Rust's", "memory", "safety", "2024"]
        );
    }

    #[test]
    fn frequencies_filter_and_count() {
        let text = "the quick brown fox jumps over the lazy dog; fox fox! a 42 ox";
        let freqs = word_frequencies(text, &TokenizeOptions::default());
        // "the"/"a"/"over" are stopwords, "42" is numeric, "ox" is too short.
        assert_eq!(freqs[0], ("fox".to_string(), 3.0));
        assert!(freqs
            .iter()
            .all(|(w, _)| w != "the" && w != "42" && w != "ox"));
        assert!(freqs.iter().any(|(w, n)| w == "quick" && *n == 1.0));
    }

    #[test]
    fn frequencies_fold_plurals_and_possessives() {
        let freqs = word_frequencies("word words word's wording", &TokenizeOptions::default());
        let count = |name: &str| freqs.iter().find(|(w, _)| w == name).map(|(_, n)| *n);
        // words -> word, word's -> word; wording stays distinct.
        assert_eq!(count("word"), Some(3.0));
        assert_eq!(count("words"), None);
        assert_eq!(count("wording"), Some(1.0));
    }

    fn solid_sprite(width: u32, height: u32) -> WordSprite {
        let stride = (width as usize + 63) >> 6;
        let mut bits = vec![0u64; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                bits[y * stride + (x >> 6)] |= 1u64 << (x & 63);
            }
        }
        WordSprite {
            width,
            height,
            stride,
            bits,
            anchor_x: 0.0,
            anchor_y: 0.0,
        }
    }

    #[test]
    fn occupancy_collision_across_block_boundaries() {
        let mut grid = Occupancy::new(128, 4);
        grid.block(70, 1);

        let sprite = solid_sprite(8, 2);
        // Covers x = 64..72, y = 0..2: overlaps the blocked bit at (70, 1).
        assert!(grid.collides(&sprite, 64, 0));
        // Unaligned placement that still overlaps.
        assert!(grid.collides(&sprite, 63, 1));
        // Clear placements on either side.
        assert!(!grid.collides(&sprite, 0, 0));
        assert!(!grid.collides(&sprite, 71, 0));
    }

    #[test]
    fn occupancy_stamp_blocks_future_placements() {
        let mut grid = Occupancy::new(100, 10);
        let sprite = solid_sprite(20, 4);
        assert!(!grid.collides(&sprite, 37, 3));
        grid.stamp(&sprite, 37, 3);
        assert!(grid.is_blocked(37, 3));
        assert!(grid.is_blocked(56, 6));
        assert!(!grid.is_blocked(57, 6));
        assert!(grid.collides(&sprite, 37, 3));
        assert!(grid.collides(&sprite, 20, 0));
        assert!(!grid.collides(&sprite, 57, 3));
    }

    #[test]
    fn occupancy_seeded_from_mask() {
        let img = RgbImage::from_fn(66, 2, |x, _| {
            if x == 65 {
                image::Rgb([0, 128, 255])
            } else {
                image::Rgb([200, 200, 200])
            }
        });
        let mask = Mask::from_image(&DynamicImage::ImageRgb8(img));
        let grid = Occupancy::from_mask(&mask);
        assert!(grid.is_blocked(65, 0));
        assert!(grid.is_blocked(65, 1));
        assert!(!grid.is_blocked(64, 0));
    }

    #[test]
    fn spiral_moves_outward_in_both_directions() {
        let offsets: Vec<_> = RectSpiral::new(200, 100, 1).take(500).collect();
        assert!(offsets.iter().any(|&(dx, _)| dx > 0));
        assert!(offsets.iter().any(|&(dx, _)| dx < 0));
        assert!(offsets.iter().any(|&(_, dy)| dy > 0));
        assert!(offsets.iter().any(|&(_, dy)| dy < 0));
    }

    #[test]
    fn build_rejects_empty_input() {
        let err = WordCloudBuilder::new().build(&[]).unwrap_err();
        assert!(matches!(err, Error::Input(_)));

        let words = vec![WordInput::new("   ", 1.0), WordInput::new("x", 0.0)];
        let err = WordCloudBuilder::new().build(&words).unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }
}
