//! Batch word-cloud generator: reads a word list and a mask image, renders
//! the cloud, writes a PNG. Arguments are positional `key=value` pairs.

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wordcloud_gen::{word_frequencies, Error, Mask, TokenizeOptions, WordCloudBuilder, WordInput};

const USAGE: &str = "Usage: wordcloud-gen [key=value ...]
Available options:
    input  : text file containing words to generate word cloud
    mask   : image file to generate mask for word cloud
    output : file name of output image";

#[derive(Debug)]
struct Params {
    input: PathBuf,
    mask: PathBuf,
    output: PathBuf,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            input: "/tmp/wordlist.txt".into(),
            mask: "mask.png".into(),
            output: "/tmp/wordcloud.png".into(),
        }
    }
}

/// Maps `key=value` tokens onto [`Params`]. Tokens that are not exactly one
/// `key=value` pair, or that carry an unknown key, are fatal usage errors.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Params, String> {
    let mut params = Params::default();
    for arg in args {
        let parts: Vec<&str> = arg.split('=').collect();
        if parts.len() != 2 {
            return Err(format!(
                "Argument {arg} not understood: Must be of the form key=value."
            ));
        }
        match parts[0] {
            "input" => params.input = parts[1].into(),
            "mask" => params.mask = parts[1].into(),
            "output" => params.output = parts[1].into(),
            key => return Err(format!("Unknown argument key {key}.")),
        }
    }
    Ok(params)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let params = match parse_args(std::env::args().skip(1)) {
        Ok(p) => p,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let text = std::fs::read_to_string(&params.input)?;
    let mask = Mask::from_file(&params.mask)?;
    info!(width = mask.width(), height = mask.height(), "mask derived");

    let frequencies = word_frequencies(&text, &TokenizeOptions::default());
    info!(words = frequencies.len(), "word list analyzed");
    let words: Vec<WordInput> = frequencies
        .iter()
        .map(|(word, count)| WordInput::new(word.clone(), *count))
        .collect();

    let cloud = WordCloudBuilder::new()
        .mask(mask)
        .max_font_size(250.0)
        .relative_scaling(0.2)
        .seed(42)
        .build(&words)?;
    info!(placed = cloud.words.len(), "layout complete");

    std::fs::write(&params.output, cloud.to_png(1.0)?)?;
    info!(output = %params.output.display(), "word cloud written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn defaults_when_no_arguments() {
        let params = parse_args(args(&[])).unwrap();
        assert_eq!(params.input, PathBuf::from("/tmp/wordlist.txt"));
        assert_eq!(params.mask, PathBuf::from("mask.png"));
        assert_eq!(params.output, PathBuf::from("/tmp/wordcloud.png"));
    }

    #[test]
    fn keys_map_to_parameters() {
        let params =
            parse_args(args(&["input=in.txt", "mask=m.png", "output=out.png"])).unwrap();
        assert_eq!(params.input, PathBuf::from("in.txt"));
        assert_eq!(params.mask, PathBuf::from("m.png"));
        assert_eq!(params.output, PathBuf::from("out.png"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = parse_args(args(&["foo=bar"])).unwrap_err();
        assert_eq!(err, "Unknown argument key foo.");
    }

    #[test]
    fn token_without_equals_is_rejected() {
        let err = parse_args(args(&["input"])).unwrap_err();
        assert_eq!(
            err,
            "Argument input not understood: Must be of the form key=value."
        );
    }

    #[test]
    fn token_with_two_equals_is_rejected() {
        let err = parse_args(args(&["input=a=b"])).unwrap_err();
        assert!(err.contains("not understood"));
    }
}
