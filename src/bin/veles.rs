// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use veles::error::ErrorKind;
use veles::server;

fn main() {
    if let Err(err) = server::run_server() {
        eprintln!("{err}");
        // A failed logging setup cannot report through the log itself and
        // carries its own exit code.
        if err.kind() == &ErrorKind::LoggerError {
            std::process::exit(-1);
        }
        std::process::exit(1);
    }
}
