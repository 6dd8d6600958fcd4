// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prints the custom resource definitions realmd relies on, as a JSON list
//! suitable for `kubectl apply -f -`.

fn main() -> Result<(), serde_json::Error> {
    let definitions = realm_cloud_resources::crd::definitions();
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": definitions,
    });
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
