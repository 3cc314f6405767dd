// Licensed under the Apache-2.0 license

pub mod i3c_bus_test;
