// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A simple example executable that manipulates pickle streams to demonstrate
//! the library's features.

use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{stdin, stdout, BufReader, Read};
use std::process::exit;

use serde::de::DeserializeSeed;
use serde_json as json;
use pickle_engine as pickle;

fn main() -> Result<(), Box<dyn Error>> {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 {
        println!("Usage: pickle (decode | transcode | to_json | from_json | stream) [filename]");
        println!();
        println!("Input is either given file or stdin.");
        println!("decode:    decode and display pickle");
        println!("transcode: decode and re-encode pickle with the highest protocol");
        println!("to_json:   decode and jsonify pickle");
        println!("from_json: encode pickle from json");
        println!("stream:    decode consecutive pickles, with offsets");
        exit(1);
    }

    let reader: Box<dyn Read> = if args.len() == 3 {
        Box::new(File::open(&args[2])?)
    } else {
        Box::new(stdin())
    };

    match &*args[1] {
        "decode" => {
            let (heap, decoded) = pickle::value_from_reader(reader, Default::default())?;
            println!("{}", heap.display(&decoded));
        },
        "transcode" => {
            let (heap, decoded) = pickle::value_from_reader(reader, Default::default())?;
            pickle::value_to_writer(&mut stdout(), &heap, &decoded, pickle::SerOptions::new().proto(-1))?;
        },
        "to_json" => {
            let (heap, decoded) = pickle::value_from_reader(reader, Default::default())?;
            println!("{}", json::to_string_pretty(&heap.serializable(&decoded))?);
        },
        "from_json" => {
            let mut heap = pickle::Heap::new();
            let mut de = json::Deserializer::from_reader(reader);
            let decoded = pickle::HeapSeed::new(&mut heap).deserialize(&mut de)?;
            pickle::value_to_writer(&mut stdout(), &heap, &decoded, pickle::SerOptions::new().proto(2))?;
        }
        "stream" => {
            let mut unpickler = pickle::Unpickler::new(BufReader::new(reader));
            loop {
                let start = unpickler.position();
                let value = unpickler.load()?;
                println!("{:8}: {}", start, unpickler.heap().display(&value));
                if unpickler.end().is_ok() {
                    break;
                }
            }
        }
        _ => {
            println!("No such subcommand.");
            exit(1);
        }
    }
    Ok(())
}
