pub fn print_banner() {
    println!(
        "\n  {} {}\n  {}\n",
        console::style("wirewatch").cyan().bold(),
        console::style(wirewatch_core::VERSION).dim(),
        console::style("windowed traffic fingerprints + isolation-forest scoring").dim(),
    );
}
