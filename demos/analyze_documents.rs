use dotenv::dotenv;
use futures::future;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tax_strategy_advisor::llm::GeminiClient;
use tax_strategy_advisor::{
    AdvisorConfig, AnalysisRequest, JsonFileReportStore, ProfileType, Report, ReportInputs,
    ReportStore, StructuredFinancials, TaxAnalyzer,
};
use tokio::fs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let jurisdiction = std::env::var("TAX_JURISDICTION").unwrap_or_else(|_| "United States".into());
    let profile: ProfileType = std::env::var("TAX_PROFILE")
        .unwrap_or_else(|_| "Individual".into())
        .parse()?;
    let notes = std::env::var("TAX_NOTES").ok();

    println!("🚀 Starting tax analysis for {} ({})...\n", jurisdiction, profile);

    let doc_dir = Path::new("demos").join("documents");
    if !doc_dir.exists() {
        fs::create_dir_all(&doc_dir).await?;
        println!("⚠️  Created 'demos/documents'. Place tax documents there to include them.");
    }

    let mut dir_stream = fs::read_dir(&doc_dir).await?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Ok(Some(entry)) = dir_stream.next_entry().await {
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }

    let config = AdvisorConfig::from_env()?;
    let client = GeminiClient::from_env()?;

    let documents = if paths.is_empty() {
        println!("📄 No documents found; analyzing structured data only.\n");
        Vec::new()
    } else {
        println!("☁️  Uploading {} document(s) to Gemini in parallel...", paths.len());
        let uploads: Vec<_> = paths.iter().map(|p| client.upload_document(p)).collect();
        let documents = future::try_join_all(uploads).await?;
        for doc in &documents {
            println!("   ✅ Uploaded: {} ({})", doc.display_name, doc.mime_type);
        }
        println!();
        documents
    };

    let mut financials = StructuredFinancials::default();
    if let Ok(income) = std::env::var("TAX_EMPLOYMENT_INCOME") {
        financials.income_and_investments.employment_income = Some(income.into());
    }

    let mut request = AnalysisRequest::new(&jurisdiction, profile).with_financials(financials);
    for doc in documents {
        request = request.with_document(doc);
    }
    if let Some(notes) = notes {
        request = request.with_notes(notes);
    }

    let analyzer = TaxAnalyzer::new(Arc::new(client), &config);
    let result = analyzer.analyze(&request).await?;

    println!("📊 Financial health\n{}\n", result.financial_health_summary);
    println!("💡 Strategies:");
    for (i, strategy) in result.strategies.iter().enumerate() {
        println!(
            "   {}. {} [{}] saves {}",
            i + 1,
            strategy.title,
            strategy.relevant_section,
            strategy.potential_savings
        );
        println!("      → {}", strategy.action);
    }
    if let Some(what_if) = &result.what_if_analysis {
        println!("\n🔮 What-if\n{}", what_if);
    }
    println!("\n📝 {}\n", result.executive_summary);

    let mut store = JsonFileReportStore::open("reports.json")?;
    let report = Report::named_after_inputs(result, ReportInputs::from(&request.validate()?));
    println!("💾 Saved \"{}\" as {}", report.name, report.id);
    store.add(report)?;

    Ok(())
}
